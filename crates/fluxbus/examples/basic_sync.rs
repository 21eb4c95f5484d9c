//! Minimal synchronous usage: subscribe, emit, read stats.
//!
//! Run with: `cargo run --example basic_sync`

use std::sync::Arc;

use fluxbus::{Bus, BusError, Event};

fn main() -> Result<(), BusError> {
    let bus = fluxbus::for_sync();

    let id = bus.on(
        "user.created",
        Arc::new(|evt| {
            println!(
                "user created: {}",
                String::from_utf8_lossy(evt.payload())
            );
            Ok(())
        }),
    );

    bus.emit(Arc::new(Event::new("user.created", "alice")))?;
    bus.emit(Arc::new(Event::new("user.created", "bob")))?;

    // Unsubscribed: this one goes nowhere.
    bus.off(id);
    bus.emit(Arc::new(Event::new("user.created", "carol")))?;

    let stats = bus.stats();
    println!("emitted={} processed={}", stats.emitted, stats.processed);
    Ok(())
}
