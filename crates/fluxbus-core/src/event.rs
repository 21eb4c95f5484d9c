//! Event, handler and statistics types.
//!
//! Fields are split hot/cold: `event_type` and `payload` are read on every
//! dispatch, the rest only by handlers that care. Events cross thread
//! boundaries as `Arc<Event>`; reusing the same `Arc` across sequential
//! emissions is a refcount bump, not an allocation.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use fxhash::FxHashMap;

use crate::error::BusError;

/// A typed event routed by the bus.
///
/// The routing key is [`event_type`](Event::event_type), a dotted ASCII
/// string such as `"user.created"`. The payload is an opaque byte buffer
/// that handlers borrow for the duration of dispatch.
#[derive(Debug, Clone, Default)]
pub struct Event {
    // Hot: read on every dispatch.
    payload: Bytes,
    event_type: String,

    // Cold: only observed by handlers.
    id: String,
    source: String,
    metadata: Option<FxHashMap<String, String>>,
    timestamp: Option<SystemTime>,
}

impl Event {
    /// Creates an event with a type and payload.
    pub fn new(event_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Creates an event whose payload is copied into the process-wide
    /// arena (a plain allocation when the arena is disabled).
    pub fn with_pooled_payload(event_type: impl Into<String>, payload: &[u8]) -> Self {
        let mut buf = crate::arena::alloc(payload.len());
        buf.copy_from_slice(payload);
        Self::new(event_type, buf.freeze())
    }

    /// The dotted routing key.
    #[inline]
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The opaque payload bytes.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Optional caller-assigned identifier. Empty when unset.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Optional origin tag. Empty when unset.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Optional string metadata.
    #[must_use]
    pub fn metadata(&self) -> Option<&FxHashMap<String, String>> {
        self.metadata.as_ref()
    }

    /// Optional emission timestamp.
    #[must_use]
    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }

    /// Sets the identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the origin tag.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Attaches a metadata key/value pair.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(FxHashMap::default)
            .insert(key.into(), value.into());
        self
    }

    /// Sets the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, ts: SystemTime) -> Self {
        self.timestamp = Some(ts);
        self
    }
}

/// An event handler.
///
/// Handlers must be cheap and must not block; the bus invokes them inline
/// on producer or worker threads.
pub type Handler = Arc<dyn Fn(&Event) -> Result<(), BusError> + Send + Sync>;

/// A batch transform stage for the flow bus.
///
/// Stages run in registration order over each batch. A stage error aborts
/// the remaining stages and skips handler dispatch for the batch.
pub type Stage = Arc<dyn Fn(&[Arc<Event>]) -> Result<(), BusError> + Send + Sync>;

/// Optional out-of-band observer for handler faults.
///
/// Receives the panic message and, when known, the event being dispatched.
pub type PanicHook = Arc<dyn Fn(&str, Option<&Event>) + Send + Sync>;

/// Point-in-time runtime statistics for a bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Events accepted by emit paths.
    pub emitted: u64,
    /// Events for which handler dispatch completed.
    pub processed: u64,
    /// Handler faults caught by guards or workers.
    pub panics: u64,
    /// Current queue backlog across rings. Zero for inline dispatch.
    pub depth: u64,
}
