//! Many producer threads fanning into the async bus, drained at exit.
//!
//! Run with: `cargo run --example async_fanout`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fluxbus::{Bus, BusError, Event};

const PRODUCERS: usize = 8;
const PER_PRODUCER: usize = 100_000;

fn main() -> Result<(), BusError> {
    let bus: Arc<dyn Bus> = Arc::from(fluxbus::for_async());

    let received = Arc::new(AtomicU64::new(0));
    {
        let received = Arc::clone(&received);
        bus.on(
            "tick",
            Arc::new(move |_evt| {
                received.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
        );
    }

    let started = Instant::now();
    let handles: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let bus = Arc::clone(&bus);
            thread::spawn(move || {
                let event = Arc::new(Event::new("tick", "payload"));
                for _ in 0..PER_PRODUCER {
                    bus.emit(Arc::clone(&event)).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    bus.drain(Duration::from_secs(10))?;

    let total = PRODUCERS * PER_PRODUCER;
    let elapsed = started.elapsed();
    println!(
        "{} events in {:?} ({:.1} M events/s), received={}",
        total,
        elapsed,
        total as f64 / elapsed.as_secs_f64() / 1e6,
        received.load(Ordering::Relaxed),
    );
    Ok(())
}
