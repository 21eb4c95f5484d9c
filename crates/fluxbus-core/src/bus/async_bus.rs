//! Asynchronous bus: per-producer SPSC rings, worker-side dispatch.
//!
//! `emit` is an enqueue onto the calling thread's ring, nothing more. The
//! scheduler's workers load the subscription snapshot and run handlers.
//! Handler errors cannot reach the emit caller; they are logged and the
//! most recent one is kept for [`ErrorReporter`] polling. Handler panics
//! are caught at the worker frame and counted.
//!
//! The producer path carries no emitted counter; the stats surface
//! reports `emitted` as `processed` (the difference at any instant is
//! exactly the ring backlog, reported as `depth`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::bus::{Bus, ErrorReporter};
use crate::counter::PerCoreCounter;
use crate::error::BusError;
use crate::event::{Event, Handler, PanicHook, Stats};
use crate::rcu::RcuCell;
use crate::registry::{SubSnapshot, SubscriberCore};
use crate::sched::{SchedConfig, ShardedScheduler};

/// Async bus configuration.
#[derive(Debug, Clone, Default)]
pub struct AsyncConfig {
    /// Worker count. Zero means half the logical CPUs, minimum one.
    pub workers: usize,
    /// Per-ring capacity. Zero means 8192.
    pub ring_capacity: usize,
}

impl AsyncConfig {
    /// Creates a builder for custom configuration.
    #[must_use]
    pub fn builder() -> AsyncConfigBuilder {
        AsyncConfigBuilder::default()
    }
}

/// Builder for [`AsyncConfig`].
#[derive(Debug, Default)]
pub struct AsyncConfigBuilder {
    workers: Option<usize>,
    ring_capacity: Option<usize>,
}

impl AsyncConfigBuilder {
    /// Sets the worker count.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Sets the per-ring capacity.
    #[must_use]
    pub fn ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = Some(capacity);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> AsyncConfig {
        AsyncConfig {
            workers: self.workers.unwrap_or(0),
            ring_capacity: self.ring_capacity.unwrap_or(0),
        }
    }
}

/// The scheduler-backed bus.
pub struct AsyncBus {
    core: Arc<SubscriberCore>,
    sched: ShardedScheduler<Arc<Event>>,
    processed: Arc<PerCoreCounter>,
    panics: Arc<PerCoreCounter>,
    last_err: Arc<Mutex<Option<BusError>>>,
    panic_hook: Arc<OnceLock<PanicHook>>,
    closed: AtomicBool,
}

#[allow(clippy::missing_panics_doc)] // mutex poisoning only
impl AsyncBus {
    /// Creates the bus and starts its workers.
    #[must_use]
    pub fn new(config: &AsyncConfig) -> Self {
        let core = Arc::new(SubscriberCore::new());
        let processed = Arc::new(PerCoreCounter::new());
        let panics = Arc::new(PerCoreCounter::new());
        let last_err: Arc<Mutex<Option<BusError>>> = Arc::new(Mutex::new(None));
        let panic_hook: Arc<OnceLock<PanicHook>> = Arc::new(OnceLock::new());

        let sched = ShardedScheduler::new(&SchedConfig {
            ring_capacity: config.ring_capacity,
            workers: config.workers,
            ..SchedConfig::default()
        });

        let dispatch = {
            let core = Arc::clone(&core);
            let processed = Arc::clone(&processed);
            let last_err = Arc::clone(&last_err);
            Arc::new(move |event: Arc<Event>| {
                let guard = RcuCell::<SubSnapshot>::pin();
                let snap = core.snapshot().load(&guard);
                for handler in snap.handlers_for(event.event_type()) {
                    if let Err(err) = (**handler)(&event) {
                        tracing::warn!(error = %err, event_type = event.event_type(), "handler error");
                        *last_err.lock().unwrap() = Some(err);
                    }
                }
                processed.add(1);
            })
        };

        let on_panic = {
            let panics = Arc::clone(&panics);
            let hook = Arc::clone(&panic_hook);
            Arc::new(move |msg: &str| {
                panics.add(1);
                // Worker-side faults carry no event context.
                if let Some(h) = hook.get() {
                    (**h)(msg, None);
                }
            })
        };

        sched.start(dispatch, Some(on_panic));

        Self {
            core,
            sched,
            processed,
            panics,
            last_err,
            panic_hook,
            closed: AtomicBool::new(false),
        }
    }

    /// Registers an out-of-band observer for caught handler faults.
    ///
    /// Faults are caught on worker threads, so the hook never receives an
    /// event reference. Only the first registration takes effect.
    pub fn set_panic_hook(&self, hook: PanicHook) {
        let _ = self.panic_hook.set(hook);
    }
}

impl Default for AsyncBus {
    fn default() -> Self {
        Self::new(&AsyncConfig::default())
    }
}

impl Bus for AsyncBus {
    fn on(&self, pattern: &str, handler: Handler) -> u64 {
        self.core.subscribe(pattern, handler)
    }

    fn off(&self, id: u64) {
        self.core.unsubscribe(id);
    }

    fn emit(&self, event: Arc<Event>) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.sched.submit(event);
        Ok(())
    }

    /// Identical to [`emit`](Bus::emit): the enqueue path has no guard or
    /// counter to strip.
    fn unsafe_emit(&self, event: Arc<Event>) -> Result<(), BusError> {
        self.emit(event)
    }

    /// Wildcard fan-out runs synchronously on the emitting thread; the
    /// first handler error is returned eagerly.
    fn emit_match(&self, event: Arc<Event>) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        let guard = RcuCell::<SubSnapshot>::pin();
        let snap = self.core.snapshot().load(&guard);
        let patterns = self.core.matcher.match_patterns(event.event_type());
        for pattern in &patterns {
            for handler in snap.handlers_for_pattern(pattern) {
                (**handler)(&event)?;
            }
        }
        self.processed.add(1);
        Ok(())
    }

    /// Identical to [`emit_match`](Bus::emit_match).
    fn unsafe_emit_match(&self, event: Arc<Event>) -> Result<(), BusError> {
        self.emit_match(event)
    }

    fn emit_batch(&self, events: &[Arc<Event>]) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        for event in events {
            self.sched.submit(Arc::clone(event));
        }
        Ok(())
    }

    fn emit_match_batch(&self, events: &[Arc<Event>]) -> Result<(), BusError> {
        for event in events {
            self.emit_match(Arc::clone(event))?;
        }
        Ok(())
    }

    fn stats(&self) -> Stats {
        let processed = self.processed.read();
        Stats {
            emitted: processed,
            processed,
            panics: self.panics.read(),
            depth: self.sched.depth(),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sched.shutdown(None);
    }

    fn drain(&self, timeout: Duration) -> Result<(), BusError> {
        if timeout.is_zero() {
            self.close();
            return Ok(());
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.sched.shutdown(Some(timeout)) {
            Ok(())
        } else {
            Err(BusError::DrainTimeout(timeout))
        }
    }
}

#[allow(clippy::missing_panics_doc)] // mutex poisoning only
impl ErrorReporter for AsyncBus {
    fn last_error(&self) -> Option<BusError> {
        self.last_err.lock().unwrap().clone()
    }

    fn clear_error(&self) {
        *self.last_err.lock().unwrap() = None;
    }
}

impl Drop for AsyncBus {
    fn drop(&mut self) {
        // A drain that timed out leaves closed set with live workers;
        // bypass the flag and force the full teardown.
        self.closed.store(true, Ordering::Release);
        self.sched.shutdown(None);
    }
}
