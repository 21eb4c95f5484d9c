//! Synchronous bus: inline dispatch on the caller's thread.
//!
//! `emit` runs every handler before returning, which makes it the only
//! variant that can hand handler errors straight back to the producer.
//! Two emit tiers exist: the safe tier installs a fault guard and updates
//! counters, the unsafe tier is a bare snapshot walk for callers that
//! trust their handlers.
//!
//! Constructed with [`SyncConfig::async_mode`], the bus additionally owns
//! a sharded SPSC scheduler and `emit` becomes an enqueue; dispatch then
//! happens on scheduler workers and handler errors flow to a bounded
//! error channel whose most recent entry is readable through
//! [`ErrorReporter`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use crate::bus::{Bus, ErrorReporter, Prewarmer};
use crate::counter::PerCoreCounter;
use crate::error::{panic_message, BusError};
use crate::event::{Event, Handler, PanicHook, Stats};
use crate::rcu::RcuCell;
use crate::registry::{SubSnapshot, SubscriberCore};
use crate::sched::{SchedConfig, ShardedScheduler};

/// Capacity of the async-mode error channel.
const ERROR_CHANNEL_CAPACITY: usize = 1024;

/// Sync bus configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Route `emit` through a scheduler instead of dispatching inline.
    pub async_mode: bool,
    /// Scheduler worker count in async mode. Zero means auto.
    pub workers: usize,
    /// Scheduler ring capacity in async mode. Zero means 8192.
    pub ring_capacity: usize,
    /// Warm the matcher for `pre_events` at construction.
    pub prewarm: bool,
    /// Event types to prewarm.
    pub pre_events: Vec<String>,
    /// Enable the global payload arena.
    pub enable_arena: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            async_mode: false,
            workers: 0,
            ring_capacity: 8192,
            prewarm: false,
            pre_events: Vec::new(),
            enable_arena: false,
        }
    }
}

impl SyncConfig {
    /// A tuned preset for high-concurrency deployments: matcher prewarmed
    /// with common event type stems.
    #[must_use]
    pub fn optimized() -> Self {
        Self {
            prewarm: true,
            pre_events: ["event", "system", "user", "order", "log", "metric", "trace", "cmd"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            ..Self::default()
        }
    }

    /// Creates a builder for custom configuration.
    #[must_use]
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }
}

/// Builder for [`SyncConfig`].
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    async_mode: Option<bool>,
    workers: Option<usize>,
    ring_capacity: Option<usize>,
    prewarm: Option<bool>,
    pre_events: Option<Vec<String>>,
    enable_arena: Option<bool>,
}

impl SyncConfigBuilder {
    /// Routes `emit` through the scheduler.
    #[must_use]
    pub fn async_mode(mut self, enabled: bool) -> Self {
        self.async_mode = Some(enabled);
        self
    }

    /// Sets the scheduler worker count (async mode).
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Sets the scheduler ring capacity (async mode).
    #[must_use]
    pub fn ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = Some(capacity);
        self
    }

    /// Prewarms the matcher for the given event types.
    #[must_use]
    pub fn prewarm(mut self, event_types: Vec<String>) -> Self {
        self.prewarm = Some(!event_types.is_empty());
        self.pre_events = Some(event_types);
        self
    }

    /// Enables the global payload arena.
    #[must_use]
    pub fn enable_arena(mut self, enabled: bool) -> Self {
        self.enable_arena = Some(enabled);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> SyncConfig {
        let defaults = SyncConfig::default();
        SyncConfig {
            async_mode: self.async_mode.unwrap_or(defaults.async_mode),
            workers: self.workers.unwrap_or(defaults.workers),
            ring_capacity: self.ring_capacity.unwrap_or(defaults.ring_capacity),
            prewarm: self.prewarm.unwrap_or(defaults.prewarm),
            pre_events: self.pre_events.unwrap_or(defaults.pre_events),
            enable_arena: self.enable_arena.unwrap_or(defaults.enable_arena),
        }
    }
}

/// Async-mode machinery: scheduler plus the error reporting chain.
struct AsyncMode {
    sched: ShardedScheduler<Arc<Event>>,
    /// Producer side of the error channel. Dropped at close so the
    /// reporter thread can exit.
    err_tx: Mutex<Option<crossbeam_channel::Sender<BusError>>>,
    last_err: Arc<Mutex<Option<BusError>>>,
    reporter: Mutex<Option<thread::JoinHandle<()>>>,
}

#[allow(clippy::missing_panics_doc)] // mutex poisoning only
impl AsyncMode {
    /// Routes a handler error towards `last_error`, never blocking: a full
    /// channel falls through to a direct store.
    fn report(&self, err: BusError) {
        let tx = self.err_tx.lock().unwrap().clone();
        report_error(tx.as_ref(), &self.last_err, err);
    }

    /// Drops the sender and joins the reporter once workers are gone.
    fn finish_reporter(&self) {
        self.err_tx.lock().unwrap().take();
        if let Some(handle) = self.reporter.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn report_error(
    tx: Option<&crossbeam_channel::Sender<BusError>>,
    last: &Mutex<Option<BusError>>,
    err: BusError,
) {
    tracing::warn!(error = %err, "async handler error");
    match tx {
        Some(tx) if tx.try_send(err.clone()).is_ok() => {}
        _ => *last.lock().unwrap() = Some(err),
    }
}

/// The synchronous (optionally scheduler-backed) bus.
pub struct SyncBus {
    core: Arc<SubscriberCore>,
    emitted: Arc<PerCoreCounter>,
    processed: Arc<PerCoreCounter>,
    panics: Arc<PerCoreCounter>,
    closed: Arc<AtomicBool>,
    panic_hook: Arc<OnceLock<PanicHook>>,
    async_mode: Option<AsyncMode>,
}

#[allow(clippy::missing_panics_doc)] // mutex poisoning only
impl SyncBus {
    /// Creates a purely synchronous bus. No background threads.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&SyncConfig::default())
    }

    /// Creates a scheduler-backed bus: `emit` enqueues, workers dispatch.
    #[must_use]
    pub fn new_async(workers: usize) -> Self {
        Self::with_config(&SyncConfig {
            async_mode: true,
            workers,
            ..SyncConfig::default()
        })
    }

    /// Creates a bus from a full configuration.
    #[must_use]
    pub fn with_config(config: &SyncConfig) -> Self {
        crate::arena::set_enabled(config.enable_arena);

        let core = Arc::new(SubscriberCore::new());
        let emitted = Arc::new(PerCoreCounter::new());
        let processed = Arc::new(PerCoreCounter::new());
        let panics = Arc::new(PerCoreCounter::new());
        let closed = Arc::new(AtomicBool::new(false));
        let panic_hook: Arc<OnceLock<PanicHook>> = Arc::new(OnceLock::new());

        let async_mode = config.async_mode.then(|| {
            let sched = ShardedScheduler::new(&SchedConfig {
                ring_capacity: config.ring_capacity,
                workers: config.workers,
                ..SchedConfig::default()
            });

            let (err_tx, err_rx) = crossbeam_channel::bounded(ERROR_CHANNEL_CAPACITY);
            let last_err = Arc::new(Mutex::new(None));

            let reporter = {
                let last_err = Arc::clone(&last_err);
                thread::spawn(move || {
                    while let Ok(err) = err_rx.recv() {
                        *last_err.lock().unwrap() = Some(err);
                    }
                })
            };

            // The closed flag gates producers only; workers keep
            // dispatching so drain can flush the backlog.
            let dispatch = {
                let core = Arc::clone(&core);
                let processed = Arc::clone(&processed);
                let tx = err_tx.clone();
                let last_err = Arc::clone(&last_err);
                Arc::new(move |event: Arc<Event>| {
                    let guard = RcuCell::<SubSnapshot>::pin();
                    let snap = core.snapshot().load(&guard);
                    for handler in snap.handlers_for(event.event_type()) {
                        if let Err(err) = (**handler)(&event) {
                            report_error(Some(&tx), &last_err, err);
                        }
                    }
                    processed.add(1);
                })
            };

            let on_panic = {
                let panics = Arc::clone(&panics);
                let tx = err_tx.clone();
                let last_err = Arc::clone(&last_err);
                let hook = Arc::clone(&panic_hook);
                Arc::new(move |msg: &str| {
                    panics.add(1);
                    report_error(Some(&tx), &last_err, BusError::HandlerPanic(msg.to_string()));
                    // Worker-side faults carry no event context.
                    if let Some(h) = hook.get() {
                        (**h)(msg, None);
                    }
                })
            };

            sched.start(dispatch, Some(on_panic));

            AsyncMode {
                sched,
                err_tx: Mutex::new(Some(err_tx)),
                last_err,
                reporter: Mutex::new(Some(reporter)),
            }
        });

        let bus = Self {
            core,
            panic_hook,
            emitted,
            processed,
            panics,
            closed,
            async_mode,
        };

        if config.prewarm {
            // Warming the two most common stems is enough to populate the
            // matcher's lock and cache structures.
            for event_type in config.pre_events.iter().take(2) {
                bus.core.matcher.has_match(event_type);
            }
        }

        bus
    }

    /// Bare snapshot walk for an exact event type. First error wins.
    fn dispatch_inline(&self, event: &Event) -> Result<(), BusError> {
        let guard = RcuCell::<SubSnapshot>::pin();
        let snap = self.core.snapshot().load(&guard);
        for handler in snap.handlers_for(event.event_type()) {
            (**handler)(event)?;
        }
        Ok(())
    }

    /// Bare matcher fan-out. First error wins.
    fn dispatch_match_inline(&self, event: &Event) -> Result<(), BusError> {
        let guard = RcuCell::<SubSnapshot>::pin();
        let snap = self.core.snapshot().load(&guard);
        let patterns = self.core.matcher.match_patterns(event.event_type());
        for pattern in &patterns {
            for handler in snap.handlers_for_pattern(pattern) {
                (**handler)(event)?;
            }
        }
        Ok(())
    }

    /// Runs `f` under the fault guard, converting a panic into an error
    /// plus a panic-counter increment. `event` is handed to the panic
    /// hook when the fault belongs to a single known event.
    fn guarded(
        &self,
        event: Option<&Event>,
        f: impl FnOnce() -> Result<(), BusError>,
    ) -> Result<(), BusError> {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(payload) => {
                self.panics.add(1);
                let msg = panic_message(payload.as_ref());
                if let Some(hook) = self.panic_hook.get() {
                    (**hook)(&msg, event);
                }
                Err(BusError::HandlerPanic(msg))
            }
        }
    }

    /// Registers an out-of-band observer for caught handler faults.
    ///
    /// The hook receives the panic message and, when the fault happened
    /// inside a single-event emit, the event itself. Only the first
    /// registration takes effect.
    pub fn set_panic_hook(&self, hook: PanicHook) {
        let _ = self.panic_hook.set(hook);
    }

    /// Async-mode wildcard emit: fan-out still happens on the emitting
    /// thread, but errors are reported instead of returned.
    fn emit_match_reported(&self, event: &Arc<Event>, mode: &AsyncMode) -> Result<(), BusError> {
        self.guarded(Some(event), || {
            self.emitted.add(1);
            let guard = RcuCell::<SubSnapshot>::pin();
            let snap = self.core.snapshot().load(&guard);
            let patterns = self.core.matcher.match_patterns(event.event_type());
            for pattern in &patterns {
                for handler in snap.handlers_for_pattern(pattern) {
                    if let Err(err) = (**handler)(event) {
                        mode.report(err);
                    }
                }
            }
            self.processed.add(1);
            Ok(())
        })
    }
}

impl Default for SyncBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for SyncBus {
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
        if let Some(mode) = &self.async_mode {
            self.emitted.add(1);
            mode.sched.submit(event);
            return Ok(());
        }
        self.guarded(Some(&event), || {
            self.emitted.add(1);
            self.dispatch_inline(&event)?;
            self.processed.add(1);
            Ok(())
        })
    }

    /// Zero-overhead emit: no guard, no counters. A handler panic unwinds
    /// into the caller.
    fn unsafe_emit(&self, event: Arc<Event>) -> Result<(), BusError> {
        self.dispatch_inline(&event)
    }

    fn emit_match(&self, event: Arc<Event>) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(mode) = &self.async_mode {
            return self.emit_match_reported(&event, mode);
        }
        self.guarded(Some(&event), || {
            self.emitted.add(1);
            self.dispatch_match_inline(&event)?;
            self.processed.add(1);
            Ok(())
        })
    }

    /// Zero-overhead wildcard emit: no guard, no counters.
    fn unsafe_emit_match(&self, event: Arc<Event>) -> Result<(), BusError> {
        self.dispatch_match_inline(&event)
    }

    fn emit_batch(&self, events: &[Arc<Event>]) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(mode) = &self.async_mode {
            self.emitted.add(events.len() as u64);
            for event in events {
                mode.sched.submit(Arc::clone(event));
            }
            return Ok(());
        }
        self.guarded(None, || {
            self.emitted.add(events.len() as u64);
            for event in events {
                self.dispatch_inline(event)?;
                self.processed.add(1);
            }
            Ok(())
        })
    }

    fn emit_match_batch(&self, events: &[Arc<Event>]) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(mode) = &self.async_mode {
            for event in events {
                self.emit_match_reported(event, mode)?;
            }
            return Ok(());
        }
        self.guarded(None, || {
            self.emitted.add(events.len() as u64);
            for event in events {
                self.dispatch_match_inline(event)?;
                self.processed.add(1);
            }
            Ok(())
        })
    }

    fn stats(&self) -> Stats {
        Stats {
            emitted: self.emitted.read(),
            processed: self.processed.read(),
            panics: self.panics.read(),
            depth: self.async_mode.as_ref().map_or(0, |m| m.sched.depth()),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mode) = &self.async_mode {
            mode.sched.shutdown(None);
            mode.finish_reporter();
        }
    }

    fn drain(&self, timeout: Duration) -> Result<(), BusError> {
        if timeout.is_zero() {
            self.close();
            return Ok(());
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match &self.async_mode {
            Some(mode) => {
                if mode.sched.shutdown(Some(timeout)) {
                    mode.finish_reporter();
                    Ok(())
                } else {
                    Err(BusError::DrainTimeout(timeout))
                }
            }
            None => Ok(()),
        }
    }
}

impl Prewarmer for SyncBus {
    fn prewarm(&self, event_types: &[&str]) {
        for event_type in event_types {
            self.core.matcher.has_match(event_type);
        }
    }
}

#[allow(clippy::missing_panics_doc)] // mutex poisoning only
impl ErrorReporter for SyncBus {
    fn last_error(&self) -> Option<BusError> {
        self.async_mode
            .as_ref()
            .and_then(|m| m.last_err.lock().unwrap().clone())
    }

    fn clear_error(&self) {
        if let Some(mode) = &self.async_mode {
            *mode.last_err.lock().unwrap() = None;
        }
    }
}

impl Drop for SyncBus {
    fn drop(&mut self) {
        // A drain that timed out leaves closed set with live workers;
        // bypass the flag and force the full teardown.
        self.closed.store(true, Ordering::Release);
        if let Some(mode) = &self.async_mode {
            mode.sched.shutdown(None);
            mode.finish_reporter();
        }
    }
}
