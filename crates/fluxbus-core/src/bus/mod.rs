//! The bus interface and its three dispatchers.
//!
//! All variants implement [`Bus`]: the same subscribe/emit surface over
//! very different delivery machinery.
//!
//! | Variant | Delivery | Best for |
//! |---------|----------|----------|
//! | [`SyncBus`] | inline on the caller | request paths, middleware |
//! | [`AsyncBus`] | sharded SPSC rings + workers | fan-out, telemetry, feeds |
//! | [`FlowBus`] | MPSC shards + batch pipeline | ETL, batch transforms |
//!
//! Optional capabilities ([`Flusher`], [`ErrorReporter`], [`Prewarmer`],
//! [`BatchStatter`]) are separate traits; feature-detect on the concrete
//! type.

mod async_bus;
mod flow;
mod sync;

pub use async_bus::{AsyncBus, AsyncConfig, AsyncConfigBuilder};
pub use flow::{FlowBus, FlowConfig, FlowConfigBuilder};
pub use sync::{SyncBus, SyncConfig, SyncConfigBuilder};

use std::sync::Arc;
use std::time::Duration;

use crate::error::BusError;
use crate::event::{Event, Handler, Stats};

/// The event bus interface implemented by every variant.
pub trait Bus: Send + Sync {
    /// Subscribes a handler under a pattern, returning the subscription id.
    fn on(&self, pattern: &str, handler: Handler) -> u64;

    /// Removes a subscription. Unknown ids are a no-op.
    fn off(&self, id: u64);

    /// Emits an event with fault protection and counter updates.
    ///
    /// # Errors
    ///
    /// Inline variants return the first handler error or a converted
    /// handler panic; queued variants accept and return `Ok`.
    fn emit(&self, event: Arc<Event>) -> Result<(), BusError>;

    /// Emits without any guard or counter updates. The fastest path; a
    /// handler panic propagates to the caller.
    ///
    /// # Errors
    ///
    /// Returns the first handler error where dispatch is inline.
    fn unsafe_emit(&self, event: Arc<Event>) -> Result<(), BusError>;

    /// Emits with wildcard pattern matching.
    ///
    /// # Errors
    ///
    /// As [`emit`](Bus::emit); pattern fan-out happens on the emitting
    /// thread for every variant.
    fn emit_match(&self, event: Arc<Event>) -> Result<(), BusError>;

    /// Wildcard emit without guard or counters.
    ///
    /// # Errors
    ///
    /// As [`unsafe_emit`](Bus::unsafe_emit).
    fn unsafe_emit_match(&self, event: Arc<Event>) -> Result<(), BusError>;

    /// Emits a batch under a single fault guard and a single counter update.
    ///
    /// # Errors
    ///
    /// Inline variants stop at the first handler error.
    fn emit_batch(&self, events: &[Arc<Event>]) -> Result<(), BusError>;

    /// Batch emit with wildcard matching.
    ///
    /// # Errors
    ///
    /// As [`emit_batch`](Bus::emit_batch).
    fn emit_match_batch(&self, events: &[Arc<Event>]) -> Result<(), BusError>;

    /// Point-in-time runtime statistics.
    fn stats(&self) -> Stats;

    /// Closes immediately: stops accepting work and tears down workers.
    /// Emits after close return `Ok` and are dropped. Idempotent.
    fn close(&self);

    /// Gracefully closes: stops accepting work and waits up to `timeout`
    /// for queued events to drain. A zero timeout is [`close`](Bus::close).
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// [`BusError::DrainTimeout`] if workers are still draining when the
    /// deadline passes.
    fn drain(&self, timeout: Duration) -> Result<(), BusError>;
}

/// Capability: force buffered partial batches through the pipeline.
pub trait Flusher {
    /// Waits long enough for buffered partial batches to be processed.
    ///
    /// # Errors
    ///
    /// None currently; the signature leaves room for transports that can
    /// fail to flush.
    fn flush(&self) -> Result<(), BusError>;
}

/// Capability: observe errors from queued dispatch, which cannot surface
/// through `emit` return values.
pub trait ErrorReporter {
    /// The most recent handler error, if any.
    fn last_error(&self) -> Option<BusError>;

    /// Clears the stored error.
    fn clear_error(&self);
}

/// Capability: warm caches for a known set of event types.
pub trait Prewarmer {
    /// Primes the matcher for the given event types.
    fn prewarm(&self, event_types: &[&str]);
}

/// Capability: batch-level counters beyond [`Stats`].
pub trait BatchStatter {
    /// Returns `(events_processed, batches_processed)`.
    fn batch_stats(&self) -> (u64, u64);
}
