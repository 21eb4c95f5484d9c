//! Flow bus: sharded MPSC rings feeding a batch pipeline.
//!
//! Events hash by type onto a shard; each shard owns a lock-free MPSC
//! ring, a dedicated consumer thread and a wake channel. Consumers gather
//! events into batches bounded by size or by a timeout window, run them
//! through the configured transform stages in order, then dispatch to
//! handlers.
//!
//! ## Slot protocol
//!
//! Ring slots carry a sequence number. The slot at position `n & mask` is
//! writable when `seq == n`: a producer claims it by CAS on `tail`, stores
//! the event, then publishes with `seq = n + 1`. The consumer reads when
//! `seq == head + 1` and releases with `seq = head + capacity`. Producers
//! contend only on the tail CAS; the single consumer never contends.
//!
//! ## Counting
//!
//! `processed` and `batches` count attempts: a batch whose stage fails is
//! counted even though handler dispatch is skipped.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::bus::{BatchStatter, Bus, ErrorReporter, Flusher};
use crate::counter::PerCoreCounter;
use crate::error::{panic_message, BusError};
use crate::event::{Event, Handler, PanicHook, Stage, Stats};
use crate::rcu::RcuCell;
use crate::registry::{SubSnapshot, SubscriberCore};

/// Shard count ceiling. Keeps the batch-emit wake bitmap in one `u64`.
const MAX_SHARDS: usize = 64;

/// Flow bus configuration.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Events per batch. Zero means 100.
    pub batch_size: usize,
    /// Maximum time a partial batch waits. Zero means 100ms.
    pub batch_timeout: Duration,
    /// Shard count. Zero means the logical CPU count, minimum 2, capped
    /// at 64, rounded up to a power of two.
    pub shards: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout: Duration::from_millis(100),
            shards: 0,
        }
    }
}

impl FlowConfig {
    /// Creates a builder for custom configuration.
    #[must_use]
    pub fn builder() -> FlowConfigBuilder {
        FlowConfigBuilder::default()
    }
}

/// Builder for [`FlowConfig`].
#[derive(Debug, Default)]
pub struct FlowConfigBuilder {
    batch_size: Option<usize>,
    batch_timeout: Option<Duration>,
    shards: Option<usize>,
}

impl FlowConfigBuilder {
    /// Sets the events-per-batch limit.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Sets the partial-batch wait window.
    #[must_use]
    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = Some(timeout);
        self
    }

    /// Sets the shard count.
    #[must_use]
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = Some(shards);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> FlowConfig {
        let defaults = FlowConfig::default();
        FlowConfig {
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            batch_timeout: self.batch_timeout.unwrap_or(defaults.batch_timeout),
            shards: self.shards.unwrap_or(defaults.shards),
        }
    }
}

struct MpscSlot<T> {
    seq: AtomicU64,
    data: UnsafeCell<MaybeUninit<T>>,
}

/// Lock-free multi-producer single-consumer ring with sequence slots.
struct MpscRing<T> {
    tail: CachePadded<AtomicU64>,
    head: CachePadded<AtomicU64>,
    buf: Box<[MpscSlot<T>]>,
    cap: u64,
    mask: u64,
}

// SAFETY: slot handoff follows the sequence protocol above. A producer
// writes a slot only after winning the tail CAS for it, and the consumer
// reads it only after the producer's release store of seq. Exactly one
// consumer advances head.
#[allow(unsafe_code)]
unsafe impl<T: Send> Send for MpscRing<T> {}
#[allow(unsafe_code)]
unsafe impl<T: Send> Sync for MpscRing<T> {}

impl<T> MpscRing<T> {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let buf: Box<[MpscSlot<T>]> = (0..capacity)
            .map(|i| MpscSlot {
                seq: AtomicU64::new(i as u64),
                data: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            tail: CachePadded::new(AtomicU64::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            buf,
            cap: capacity as u64,
            mask: capacity as u64 - 1,
        }
    }

    /// Claims a slot and publishes `item`, or hands it back when full.
    fn push(&self, item: T) -> Result<(), T> {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.buf[(tail & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            if seq == tail {
                match self.tail.compare_exchange_weak(
                    tail,
                    tail + 1,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS for `tail` grants
                        // exclusive write access to this slot until the
                        // seq store publishes it.
                        unsafe {
                            (*slot.data.get()).write(item);
                        }
                        slot.seq.store(tail + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => tail = current,
                }
            } else if seq < tail {
                // The consumer has not released this slot yet.
                return Err(item);
            } else {
                // Another producer claimed ahead of us; reload and retry.
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Pops up to `max` published items into `out`.
    ///
    /// Single consumer only.
    fn pop_batch(&self, out: &mut Vec<T>, max: usize) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let mut count: u64 = 0;
        while (count as usize) < max {
            let idx = head + count;
            let slot = &self.buf[(idx & self.mask) as usize];
            if slot.seq.load(Ordering::Acquire) != idx + 1 {
                break;
            }
            // SAFETY: seq == idx + 1 means the producer published this
            // slot and nobody may touch it until we bump seq below.
            let item = unsafe { (*slot.data.get()).assume_init_read() };
            slot.seq.store(idx + self.cap, Ordering::Release);
            out.push(item);
            count += 1;
        }
        if count > 0 {
            self.head.store(head + count, Ordering::Release);
        }
        count as usize
    }

    /// Backlog snapshot.
    fn len(&self) -> u64 {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.saturating_sub(head)
    }
}

impl<T> Drop for MpscRing<T> {
    fn drop(&mut self) {
        let mut leftovers = Vec::new();
        while self.pop_batch(&mut leftovers, 64) > 0 {
            leftovers.clear();
        }
    }
}

struct FlowShard {
    ring: MpscRing<Arc<Event>>,
    wake_tx: crossbeam_channel::Sender<()>,
}

struct FlowInner {
    core: SubscriberCore,
    shards: Box<[FlowShard]>,
    shard_mask: u64,
    stages: Box<[Stage]>,
    batch_size: usize,
    batch_timeout: Duration,
    closed: AtomicBool,
    stop: AtomicBool,
    emitted: AtomicU64,
    processed: AtomicU64,
    batches: AtomicU64,
    panics: PerCoreCounter,
    last_err: Mutex<Option<BusError>>,
    panic_hook: OnceLock<PanicHook>,
    live: Mutex<usize>,
    exited: Condvar,
}

#[allow(clippy::missing_panics_doc)] // mutex poisoning only
impl FlowInner {
    /// Rolling byte hash of the event type, masked to a shard.
    #[inline]
    fn shard_of(&self, event_type: &str) -> usize {
        let mut h: u64 = 0;
        for b in event_type.bytes() {
            h = h.wrapping_mul(31).wrapping_add(u64::from(b));
        }
        (h & self.shard_mask) as usize
    }

    /// Runs a batch under the consumer fault guard.
    fn safe_process(&self, batch: &[Arc<Event>]) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.process_batch(batch))) {
            self.panics.add(1);
            let msg = panic_message(payload.as_ref());
            tracing::warn!(%msg, "batch dispatch panic caught");
            // Batch-level fault: no single event to attribute it to.
            if let Some(hook) = self.panic_hook.get() {
                (**hook)(&msg, None);
            }
        }
    }

    /// Stages first, handlers second, counters always.
    fn process_batch(&self, batch: &[Arc<Event>]) {
        if batch.is_empty() {
            return;
        }

        for stage in &*self.stages {
            if let Err(err) = (**stage)(batch) {
                tracing::warn!(error = %err, len = batch.len(), "stage failed, batch dropped");
                *self.last_err.lock().unwrap() = Some(err);
                self.processed.fetch_add(batch.len() as u64, Ordering::Relaxed);
                self.batches.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let guard = RcuCell::<SubSnapshot>::pin();
        let snap = self.core.snapshot().load(&guard);
        if !snap.handlers.is_empty() {
            if snap.has_wildcard {
                for event in batch {
                    let patterns = self.core.matcher.match_patterns(event.event_type());
                    for pattern in &patterns {
                        for handler in snap.handlers_for_pattern(pattern) {
                            if let Err(err) = (**handler)(event) {
                                tracing::warn!(error = %err, "handler error in batch");
                                *self.last_err.lock().unwrap() = Some(err);
                            }
                        }
                    }
                }
            } else {
                // No wildcard subscribers: the direct map lookup suffices.
                for event in batch {
                    for handler in snap.handlers_for(event.event_type()) {
                        if let Err(err) = (**handler)(event) {
                            tracing::warn!(error = %err, "handler error in batch");
                            *self.last_err.lock().unwrap() = Some(err);
                        }
                    }
                }
            }
        }

        self.processed.fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Per-shard consumer: wake-driven batching with a deadline for
    /// partial batches, full drain on shutdown.
    fn consumer_run(&self, shard_idx: usize, wake_rx: &crossbeam_channel::Receiver<()>) {
        let ring = &self.shards[shard_idx].ring;
        let mut pending: Vec<Arc<Event>> = Vec::with_capacity(self.batch_size);
        let mut deadline: Option<Instant> = None;

        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            let wait = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()),
                None => self.batch_timeout,
            };
            let _ = wake_rx.recv_timeout(wait);

            // Gather whatever is published, processing every full batch.
            loop {
                let want = self.batch_size - pending.len();
                ring.pop_batch(&mut pending, want);
                if pending.len() == self.batch_size {
                    self.safe_process(&pending);
                    pending.clear();
                    deadline = None;
                } else {
                    break;
                }
            }

            if pending.is_empty() {
                deadline = None;
            } else {
                match deadline {
                    None => deadline = Some(Instant::now() + self.batch_timeout),
                    Some(d) if Instant::now() >= d => {
                        // Window expired: flush the partial batch.
                        self.safe_process(&pending);
                        pending.clear();
                        deadline = None;
                    }
                    Some(_) => {}
                }
            }
        }

        // Shutdown: flush buffered events plus everything still in the ring.
        loop {
            let want = self.batch_size.saturating_sub(pending.len());
            ring.pop_batch(&mut pending, want);
            if pending.is_empty() {
                break;
            }
            self.safe_process(&pending);
            pending.clear();
        }

        let mut live = self.live.lock().unwrap();
        *live -= 1;
        drop(live);
        self.exited.notify_all();
    }

    /// Enqueues onto the home shard, falling back to any shard with room,
    /// and finally to synchronous processing. Returns the shard woken, or
    /// `None` when the event was processed inline.
    fn enqueue(&self, event: Arc<Event>) -> Option<usize> {
        let home = self.shard_of(event.event_type());
        let mut event = event;
        match self.shards[home].ring.push(event) {
            Ok(()) => return Some(home),
            Err(back) => event = back,
        }
        for (idx, shard) in self.shards.iter().enumerate() {
            match shard.ring.push(event) {
                Ok(()) => return Some(idx),
                Err(back) => event = back,
            }
        }
        // Every ring is full: process inline rather than dropping.
        self.safe_process(&[event]);
        None
    }

    fn wake(&self, shard_idx: usize) {
        let _ = self.shards[shard_idx].wake_tx.try_send(());
    }
}

/// The batching pipeline bus.
pub struct FlowBus {
    inner: Arc<FlowInner>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

#[allow(clippy::missing_panics_doc)] // mutex poisoning only
impl FlowBus {
    /// Creates the bus and starts one consumer thread per shard.
    ///
    /// `stages` run in order over every batch before handler dispatch.
    #[must_use]
    pub fn new(stages: Vec<Stage>, config: &FlowConfig) -> Self {
        let batch_size = if config.batch_size == 0 {
            100
        } else {
            config.batch_size
        };
        let batch_timeout = if config.batch_timeout.is_zero() {
            Duration::from_millis(100)
        } else {
            config.batch_timeout
        };
        let shard_count = if config.shards == 0 {
            num_cpus::get().max(2)
        } else {
            config.shards.max(2)
        }
        .min(MAX_SHARDS)
        .next_power_of_two();

        let ring_capacity = batch_size * 4;

        let mut wake_rxs = Vec::with_capacity(shard_count);
        let shards: Box<[FlowShard]> = (0..shard_count)
            .map(|_| {
                let (tx, rx) = crossbeam_channel::bounded(1);
                wake_rxs.push(rx);
                FlowShard {
                    ring: MpscRing::new(ring_capacity),
                    wake_tx: tx,
                }
            })
            .collect();

        let inner = Arc::new(FlowInner {
            core: SubscriberCore::new(),
            shards,
            shard_mask: shard_count as u64 - 1,
            stages: stages.into_boxed_slice(),
            batch_size,
            batch_timeout,
            closed: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            emitted: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            panics: PerCoreCounter::new(),
            last_err: Mutex::new(None),
            panic_hook: OnceLock::new(),
            live: Mutex::new(shard_count),
            exited: Condvar::new(),
        });

        let workers = wake_rxs
            .into_iter()
            .enumerate()
            .map(|(idx, rx)| {
                let inner = Arc::clone(&inner);
                thread::spawn(move || inner.consumer_run(idx, &rx))
            })
            .collect();

        tracing::debug!(shards = shard_count, batch_size, "flow bus started");

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Registers an out-of-band observer for caught batch faults.
    ///
    /// Faults are caught per batch on consumer threads, so the hook never
    /// receives an event reference. Only the first registration takes
    /// effect.
    pub fn set_panic_hook(&self, hook: PanicHook) {
        let _ = self.inner.panic_hook.set(hook);
    }

    /// Stops consumers and optionally waits out a deadline for them to
    /// finish draining. Returns whether all consumers exited.
    fn stop_consumers(&self, timeout: Option<Duration>) -> bool {
        self.inner.stop.store(true, Ordering::Release);
        for idx in 0..self.inner.shards.len() {
            self.inner.wake(idx);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        {
            let mut live = self.inner.live.lock().unwrap();
            while *live > 0 {
                match deadline {
                    Some(d) => {
                        let now = Instant::now();
                        if now >= d {
                            return false;
                        }
                        let (guard, _timeout) =
                            self.inner.exited.wait_timeout(live, d - now).unwrap();
                        live = guard;
                    }
                    None => live = self.inner.exited.wait(live).unwrap(),
                }
            }
        }

        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        true
    }

    fn emit_inner(&self, event: Arc<Event>, count: bool) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if count {
            self.inner.emitted.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(shard_idx) = self.inner.enqueue(event) {
            self.inner.wake(shard_idx);
        }
        Ok(())
    }
}

impl Bus for FlowBus {
    fn on(&self, pattern: &str, handler: Handler) -> u64 {
        self.inner.core.subscribe(pattern, handler)
    }

    fn off(&self, id: u64) {
        self.inner.core.unsubscribe(id);
    }

    fn emit(&self, event: Arc<Event>) -> Result<(), BusError> {
        self.emit_inner(event, true)
    }

    /// As [`emit`](Bus::emit) minus the emitted counter.
    fn unsafe_emit(&self, event: Arc<Event>) -> Result<(), BusError> {
        self.emit_inner(event, false)
    }

    /// Identical to [`emit`](Bus::emit): matching happens on the consumer
    /// side, driven by the snapshot's wildcard flag.
    fn emit_match(&self, event: Arc<Event>) -> Result<(), BusError> {
        self.emit(event)
    }

    /// Identical to [`unsafe_emit`](Bus::unsafe_emit).
    fn unsafe_emit_match(&self, event: Arc<Event>) -> Result<(), BusError> {
        self.unsafe_emit(event)
    }

    fn emit_batch(&self, events: &[Arc<Event>]) -> Result<(), BusError> {
        if events.is_empty() || self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.inner
            .emitted
            .fetch_add(events.len() as u64, Ordering::Relaxed);

        // One wake per touched shard, sent after the whole batch is in.
        let mut touched: u64 = 0;
        for event in events {
            if let Some(shard_idx) = self.inner.enqueue(Arc::clone(event)) {
                touched |= 1 << shard_idx;
            }
        }
        let mut remaining = touched;
        while remaining != 0 {
            let idx = remaining.trailing_zeros() as usize;
            self.inner.wake(idx);
            remaining &= remaining - 1;
        }
        Ok(())
    }

    fn emit_match_batch(&self, events: &[Arc<Event>]) -> Result<(), BusError> {
        self.emit_batch(events)
    }

    fn stats(&self) -> Stats {
        Stats {
            emitted: self.inner.emitted.load(Ordering::Relaxed),
            processed: self.inner.processed.load(Ordering::Relaxed),
            panics: self.inner.panics.read(),
            depth: self.inner.shards.iter().map(|s| s.ring.len()).sum(),
        }
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_consumers(None);
    }

    fn drain(&self, timeout: Duration) -> Result<(), BusError> {
        if timeout.is_zero() {
            self.close();
            return Ok(());
        }
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.stop_consumers(Some(timeout)) {
            Ok(())
        } else {
            Err(BusError::DrainTimeout(timeout))
        }
    }
}

impl Flusher for FlowBus {
    /// Sleeps one batch-timeout window so partial batches hit their
    /// deadline and get processed.
    fn flush(&self) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        thread::sleep(self.inner.batch_timeout);
        Ok(())
    }
}

impl BatchStatter for FlowBus {
    fn batch_stats(&self) -> (u64, u64) {
        (
            self.inner.processed.load(Ordering::Relaxed),
            self.inner.batches.load(Ordering::Relaxed),
        )
    }
}

#[allow(clippy::missing_panics_doc)] // mutex poisoning only
impl ErrorReporter for FlowBus {
    fn last_error(&self) -> Option<BusError> {
        self.inner.last_err.lock().unwrap().clone()
    }

    fn clear_error(&self) {
        *self.inner.last_err.lock().unwrap() = None;
    }
}

impl Drop for FlowBus {
    fn drop(&mut self) {
        // A drain that timed out leaves closed set with live consumers;
        // bypass the flag and force the full teardown.
        self.inner.closed.store(true, Ordering::Release);
        self.stop_consumers(None);
    }
}
