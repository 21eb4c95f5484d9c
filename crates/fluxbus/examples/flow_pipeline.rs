//! A flow bus with transform stages: validate, then annotate a metric.
//!
//! Run with: `cargo run --example flow_pipeline`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fluxbus::{BatchStatter, Bus, BusError, Event, FlowBus, FlowConfig, Stage};

fn main() -> Result<(), BusError> {
    let validated = Arc::new(AtomicU64::new(0));
    let validate: Stage = {
        let validated = Arc::clone(&validated);
        Arc::new(move |batch| {
            for event in batch {
                if event.payload().is_empty() {
                    return Err(BusError::handler("empty payload in batch"));
                }
            }
            validated.fetch_add(batch.len() as u64, Ordering::Relaxed);
            Ok(())
        })
    };

    let measure: Stage = Arc::new(|batch| {
        let bytes: usize = batch.iter().map(|e| e.payload().len()).sum();
        println!("stage: batch of {} events, {} bytes", batch.len(), bytes);
        Ok(())
    });

    let bus = FlowBus::new(
        vec![validate, measure],
        &FlowConfig {
            batch_size: 8,
            batch_timeout: Duration::from_millis(20),
            shards: 0,
        },
    );

    bus.on(
        "orders.row",
        Arc::new(|evt| {
            let _ = evt.payload();
            Ok(())
        }),
    );

    for i in 0..30 {
        let row = format!("order-{i}");
        bus.emit(Arc::new(Event::new("orders.row", row.into_bytes())))?;
    }

    bus.drain(Duration::from_secs(5))?;

    let (processed, batches) = bus.batch_stats();
    println!(
        "processed={processed} batches={batches} validated={}",
        validated.load(Ordering::Relaxed)
    );
    Ok(())
}
