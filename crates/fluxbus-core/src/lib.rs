//! # `fluxbus` Core
//!
//! The dispatch engine for `fluxbus`: an in-process event bus that routes
//! typed events to subscribed handlers at very high throughput.
//!
//! This crate provides:
//! - **Pattern matcher**: trie-based wildcard matching (`*`, `**`) with a
//!   sharded result cache
//! - **Subscription snapshots**: RCU-published, pre-flattened handler lists
//! - **Sharded SPSC scheduler**: per-producer lock-free rings with static
//!   worker affinity and three-level adaptive idle
//! - **Bus variants**: [`SyncBus`](bus::SyncBus), [`AsyncBus`](bus::AsyncBus)
//!   and [`FlowBus`](bus::FlowBus) behind one [`Bus`](bus::Bus) trait
//!
//! ## Design Principles
//!
//! 1. **Zero allocations on the emit path** - events travel as `Arc<Event>`
//! 2. **No locks on the hot path** - RCU snapshots, SPSC rings, sharded counters
//! 3. **Fail-open dispatch** - handler faults are isolated and counted,
//!    never tear down a worker
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use fluxbus_core::bus::{Bus, SyncBus};
//! use fluxbus_core::event::Event;
//!
//! let bus = SyncBus::new();
//! bus.on("user.created", Arc::new(|evt| {
//!     assert_eq!(evt.event_type(), "user.created");
//!     Ok(())
//! }));
//! bus.emit(Arc::new(Event::new("user.created", "alice"))).unwrap();
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Unsafe is confined to the ring buffers and the RCU cell, each with
// documented SAFETY reasoning.
#![allow(unsafe_code)]

pub mod arena;
pub mod bus;
pub mod counter;
pub mod error;
pub mod event;
pub mod matcher;
pub mod rcu;
mod registry;
pub mod sched;

pub use bus::{AsyncBus, Bus, FlowBus, SyncBus};
pub use error::BusError;
pub use event::{Event, Handler, PanicHook, Stage, Stats};

/// Result type for fluxbus-core operations.
pub type Result<T> = std::result::Result<T, BusError>;
