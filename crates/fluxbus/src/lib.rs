//! # fluxbus
//!
//! An in-process event bus for dispatching typed events to subscribed
//! handlers at very high throughput. Three interchangeable dispatchers
//! share one interface:
//!
//! - **Sync**: inline dispatch on the caller, handler errors returned
//! - **Async**: per-producer SPSC rings drained by a worker pool
//! - **Flow**: sharded batching pipeline with transform stages
//!
//! ## Entry points
//!
//! ```rust
//! use std::sync::Arc;
//! use fluxbus::{Bus, Event};
//!
//! // Zero-config: picks async on 4+ cores, sync otherwise.
//! let bus = fluxbus::new();
//! bus.on("user.created", Arc::new(|evt| {
//!     println!("hello {:?}", evt.payload());
//!     Ok(())
//! }));
//! bus.emit(Arc::new(Event::new("user.created", "alice"))).unwrap();
//! bus.drain(std::time::Duration::from_secs(1)).unwrap();
//! ```
//!
//! Named factories ([`for_sync`], [`for_async`], [`for_flow`]), string
//! scenarios ([`scenario`]) and full [`Profile`] control ([`with_profile`])
//! layer on top of the same machinery.
//!
//! ## Package-level bus
//!
//! A process-wide sync bus backs the free functions [`on`], [`emit`] and
//! friends, for code that wants event plumbing without threading a bus
//! handle around.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod profile;

pub use fluxbus_core::bus::{
    AsyncBus, AsyncConfig, AsyncConfigBuilder, BatchStatter, Bus, ErrorReporter, Flusher, FlowBus,
    FlowConfig, FlowConfigBuilder, Prewarmer, SyncBus, SyncConfig, SyncConfigBuilder,
};
pub use fluxbus_core::{arena, BusError, Event, Handler, PanicHook, Stage, Stats};
pub use profile::{auto_detect, Advised, Advisor, Auto, Impl, Latency, MemPosture, Profile};

use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Builds a bus from advised parameters.
#[must_use]
fn build(advised: &Advised) -> Box<dyn Bus> {
    arena::set_enabled(advised.arena);

    match advised.implementation {
        Impl::Sync => {
            let config = SyncConfig {
                prewarm: !advised.prewarm.is_empty(),
                pre_events: advised.prewarm.clone(),
                ..SyncConfig::default()
            };
            Box::new(SyncBus::with_config(&config))
        }
        Impl::Async => Box::new(AsyncBus::new(&AsyncConfig {
            workers: advised.workers,
            ring_capacity: advised.ring_capacity,
        })),
        Impl::Flow => {
            // A pass-through stage keeps the pipeline shape; callers with
            // real transforms construct FlowBus directly.
            let stages: Vec<Stage> = vec![Arc::new(|_batch| Ok(()))];
            Box::new(FlowBus::new(
                stages,
                &FlowConfig {
                    batch_size: if advised.batch_size == 0 {
                        100
                    } else {
                        advised.batch_size
                    },
                    batch_timeout: advised.batch_timeout,
                    shards: 0,
                },
            ))
        }
    }
}

/// Zero-config constructor: async on four or more cores, sync otherwise.
#[must_use]
pub fn new() -> Box<dyn Bus> {
    with_profile(&auto_detect())
}

/// Creates a synchronous direct-call bus.
#[must_use]
pub fn for_sync() -> Box<dyn Bus> {
    with_profile(&Profile::sync())
}

/// Creates a high-throughput async bus.
#[must_use]
pub fn for_async() -> Box<dyn Bus> {
    with_profile(&Profile::r#async())
}

/// Creates a batching pipeline bus.
#[must_use]
pub fn for_flow() -> Box<dyn Bus> {
    with_profile(&Profile::flow())
}

/// Creates a bus from a preset name: `"sync"`, `"async"` or `"flow"`.
/// Unknown names fall back to sync.
#[must_use]
pub fn scenario(name: &str) -> Box<dyn Bus> {
    with_profile(&Profile::preset(name))
}

/// Creates a bus from a full profile.
#[must_use]
pub fn with_profile(profile: &Profile) -> Box<dyn Bus> {
    build(&Advisor::new().advise(profile))
}

static DEFAULT_BUS: OnceLock<SyncBus> = OnceLock::new();

/// The process-wide default bus (sync semantics, no background threads,
/// nothing to close).
pub fn default_bus() -> &'static SyncBus {
    DEFAULT_BUS.get_or_init(SyncBus::new)
}

/// Subscribes on the default bus.
pub fn on(pattern: &str, handler: Handler) -> u64 {
    default_bus().on(pattern, handler)
}

/// Unsubscribes from the default bus.
pub fn off(id: u64) {
    default_bus().off(id);
}

/// Emits on the default bus, returning the first handler error.
///
/// # Errors
///
/// The first handler error, or a converted handler panic.
pub fn emit(event: Arc<Event>) -> Result<(), BusError> {
    default_bus().emit(event)
}

/// Emits on the default bus without guard or counters.
///
/// # Errors
///
/// The first handler error.
pub fn unsafe_emit(event: Arc<Event>) -> Result<(), BusError> {
    default_bus().unsafe_emit(event)
}

/// Wildcard emit on the default bus.
///
/// # Errors
///
/// As [`emit`].
pub fn emit_match(event: Arc<Event>) -> Result<(), BusError> {
    default_bus().emit_match(event)
}

/// Wildcard emit on the default bus without guard or counters.
///
/// # Errors
///
/// As [`unsafe_emit`].
pub fn unsafe_emit_match(event: Arc<Event>) -> Result<(), BusError> {
    default_bus().unsafe_emit_match(event)
}

/// Batch emit on the default bus.
///
/// # Errors
///
/// As [`emit`]; dispatch stops at the first failing event.
pub fn emit_batch(events: &[Arc<Event>]) -> Result<(), BusError> {
    default_bus().emit_batch(events)
}

/// Wildcard batch emit on the default bus.
///
/// # Errors
///
/// As [`emit_batch`].
pub fn emit_match_batch(events: &[Arc<Event>]) -> Result<(), BusError> {
    default_bus().emit_match_batch(events)
}

/// Stats of the default bus.
#[must_use]
pub fn stats() -> Stats {
    default_bus().stats()
}

/// Gracefully closes the default bus. The package-level API is unusable
/// afterwards; call only at process exit.
///
/// # Errors
///
/// [`BusError::DrainTimeout`] when the deadline passes first.
pub fn drain(timeout: Duration) -> Result<(), BusError> {
    default_bus().drain(timeout)
}
