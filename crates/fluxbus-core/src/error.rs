//! Bus error types.
//!
//! The bus surfaces exactly three failures to callers: a handler-returned
//! error (sync eager dispatch), a caught handler fault, and a drain timeout.
//! Everything else (ring-full back-pressure, emits after close) is absorbed
//! internally.

use std::time::Duration;

/// Error type for all bus operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// An error returned by a subscribed handler.
    #[error("handler error: {0}")]
    Handler(String),

    /// A handler panicked; the fault was caught and converted.
    #[error("handler panic: {0}")]
    HandlerPanic(String),

    /// Workers did not exit within the drain deadline.
    #[error("graceful close timed out after {0:?}")]
    DrainTimeout(Duration),

    /// Invalid configuration provided at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BusError {
    /// Creates a handler error from any displayable message.
    ///
    /// Convenience for handler bodies: `Err(BusError::handler("bad payload"))`.
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// Returns true if this is a handler-returned error.
    #[must_use]
    pub fn is_handler(&self) -> bool {
        matches!(self, Self::Handler(_))
    }

    /// Returns true if this error was converted from a caught panic.
    #[must_use]
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::HandlerPanic(_))
    }
}

/// Extracts a printable message from a caught panic payload.
#[must_use]
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
