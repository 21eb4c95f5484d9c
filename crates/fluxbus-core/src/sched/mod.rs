//! Sharded SPSC scheduler.
//!
//! The async dispatch engine: producers enqueue into per-producer SPSC
//! rings, a fixed set of workers drains them with static affinity.
//!
//! ## Architecture
//!
//! - `ring_count` = logical CPU count rounded up to a power of two; shard
//!   selection is `token & mask`.
//! - Every producer thread receives a persistent token at first touch and
//!   always writes the same ring. Two threads can still hash onto one
//!   ring, so each ring carries a producer gate: a spinlock held only for
//!   the ring write. Uncontended it is one compare-and-swap; it restores
//!   the single-writer invariant the ring requires.
//! - Worker `i` statically owns rings `{i, i + workers, i + 2*workers, ...}`.
//!   No work stealing; each ring has exactly one consumer forever.
//!
//! ## Idle behavior
//!
//! A worker that finds all its rings empty escalates through three levels:
//! spin-loop hints (stays on-CPU, nanosecond wakeup), cooperative yields,
//! and finally parking on a condvar permit gate. Producers wake at most
//! one parked worker per enqueue.
//!
//! ## Ordering
//!
//! FIFO per ring only. Emissions from one thread stay FIFO as long as the
//! thread keeps its token, which it does for its lifetime; across threads
//! there is no order.

pub mod ring;

pub use ring::SpscRing;

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::panic_message;

/// Events drained from one ring before moving to the next.
const DRAIN_BATCH: usize = 32;

/// Spin-loop hints issued per idle iteration at level zero.
const SPIN_CYCLES: usize = 10;

/// Upper bound on a park before the worker rechecks its rings. Covers the
/// enqueue-before-park race without a second synchronization round trip.
const PARK_RECHECK: Duration = Duration::from_millis(10);

/// Callback invoked with the message of a caught worker panic.
pub type PanicCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Worker-side dispatch function invoked for every dequeued event.
pub type DispatchFn<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Idle escalation thresholds.
///
/// The defaults (4096 spins, then 256 yields, then park) keep a worker
/// on-CPU for roughly the submit interval of a busy single producer before
/// it starts giving the core away.
#[derive(Debug, Clone, Copy)]
pub struct IdleConfig {
    /// Iterations of spin-loop hints before yielding.
    pub spin_limit: u32,
    /// Iterations of cooperative yields before parking.
    pub yield_limit: u32,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            spin_limit: 4096,
            yield_limit: 256,
        }
    }
}

/// Scheduler construction parameters.
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Per-ring capacity, rounded up to a power of two.
    pub ring_capacity: usize,
    /// Worker count. Zero means half the logical CPUs, minimum one.
    pub workers: usize,
    /// Idle escalation thresholds.
    pub idle: IdleConfig,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 8192,
            workers: 0,
            idle: IdleConfig::default(),
        }
    }
}

/// Default worker count: half the logical CPUs, at least one.
#[must_use]
pub fn default_workers() -> usize {
    (num_cpus::get() / 2).max(1)
}

static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static PRODUCER_TOKEN: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// The calling thread's persistent shard token, assigned at first touch.
fn producer_token() -> usize {
    PRODUCER_TOKEN.with(|t| {
        let mut v = t.get();
        if v == usize::MAX {
            v = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
            t.set(v);
        }
        v
    })
}

/// Per-ring producer exclusion.
///
/// Held only across the ring write. Contention happens only when two
/// producer threads hash onto the same ring, so the backoff ladder stays
/// shallow: spin, then yield, then micro-sleep.
struct ProducerGate {
    locked: AtomicBool,
}

impl ProducerGate {
    const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    fn acquire(&self) {
        let mut attempts = 0_u32;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            attempts = attempts.saturating_add(1);
            if attempts <= 4 {
                std::hint::spin_loop();
            } else if attempts <= 8 {
                thread::yield_now();
            } else {
                let sleep_us = (1_u64 << (attempts - 8).min(6)).min(100);
                thread::sleep(Duration::from_micros(sleep_us));
            }
        }
    }

    #[inline]
    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

struct Shard<T> {
    gate: ProducerGate,
    ring: SpscRing<T>,
}

struct SchedState {
    /// Wake permits outstanding, capped at the worker count.
    permits: usize,
    /// Workers that have not exited yet.
    live: usize,
}

struct SchedInner<T> {
    shards: Box<[Shard<T>]>,
    ring_mask: usize,
    workers: usize,
    idle: IdleConfig,
    stop: AtomicBool,
    parked: AtomicUsize,
    state: Mutex<SchedState>,
    wake_cv: Condvar,
}

// State-lock poisoning would require a panic inside trivial bookkeeping.
#[allow(clippy::missing_panics_doc)]
impl<T: Send + 'static> SchedInner<T> {
    fn wake_one(&self) {
        let mut st = self.state.lock().unwrap();
        if st.permits < self.workers {
            st.permits += 1;
        }
        drop(st);
        self.wake_cv.notify_one();
    }

    fn park(&self) {
        self.parked.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock().unwrap();
        if st.permits == 0 && !self.stop.load(Ordering::Acquire) {
            let (guard, _timeout) = self.wake_cv.wait_timeout(st, PARK_RECHECK).unwrap();
            st = guard;
        }
        if st.permits > 0 {
            st.permits -= 1;
        }
        drop(st);
        self.parked.fetch_sub(1, Ordering::SeqCst);
    }

    /// The worker hot loop: poll owned rings, escalate idleness, return on
    /// stop or on a dispatched panic unwinding through the caller's guard.
    fn drain_until_stop(&self, owned: &[usize], dispatch: &DispatchFn<T>) {
        let mut idle: u32 = 0;
        while !self.stop.load(Ordering::Acquire) {
            let mut consumed = false;
            for &ri in owned {
                let drained = self.shards[ri].ring.pop_each(DRAIN_BATCH, |item| {
                    (**dispatch)(item);
                    true
                });
                consumed = consumed || drained > 0;
            }

            if consumed {
                idle = 0;
                continue;
            }

            idle += 1;
            if idle <= self.idle.spin_limit {
                for _ in 0..SPIN_CYCLES {
                    std::hint::spin_loop();
                }
            } else if idle <= self.idle.spin_limit + self.idle.yield_limit {
                thread::yield_now();
            } else {
                self.park();
                idle = 0;
            }
        }
    }

    fn worker_run(
        &self,
        id: usize,
        owned: &[usize],
        dispatch: &DispatchFn<T>,
        on_panic: Option<&PanicCallback>,
    ) {
        while !self.stop.load(Ordering::Acquire) {
            let result = catch_unwind(AssertUnwindSafe(|| self.drain_until_stop(owned, dispatch)));
            if let Err(payload) = result {
                let msg = panic_message(payload.as_ref());
                tracing::warn!(worker = id, %msg, "dispatch panic caught, worker continues");
                if let Some(cb) = on_panic {
                    (**cb)(&msg);
                }
            }
        }

        // Stop observed: drain owned rings once more so accepted events are
        // not stranded, still fault-isolated per event.
        for &ri in owned {
            while let Some(item) = self.shards[ri].ring.pop() {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (**dispatch)(item))) {
                    let msg = panic_message(payload.as_ref());
                    if let Some(cb) = on_panic {
                        (**cb)(&msg);
                    }
                }
            }
        }

        let mut st = self.state.lock().unwrap();
        st.live -= 1;
        drop(st);
        self.wake_cv.notify_all();
    }
}

/// Sharded SPSC scheduler: many producers, fixed workers, per-ring FIFO.
pub struct ShardedScheduler<T> {
    inner: Arc<SchedInner<T>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

#[allow(clippy::missing_panics_doc)]
impl<T: Send + 'static> ShardedScheduler<T> {
    /// Creates a scheduler. Rings are sized and counted per the config;
    /// no workers run until [`start`](Self::start).
    #[must_use]
    pub fn new(config: &SchedConfig) -> Self {
        let ring_count = num_cpus::get().next_power_of_two();
        let workers = if config.workers == 0 {
            default_workers()
        } else {
            config.workers
        };
        let capacity = if config.ring_capacity == 0 {
            8192
        } else {
            config.ring_capacity
        };

        let shards: Box<[Shard<T>]> = (0..ring_count)
            .map(|_| Shard {
                gate: ProducerGate::new(),
                ring: SpscRing::new(capacity),
            })
            .collect();

        Self {
            inner: Arc::new(SchedInner {
                shards,
                ring_mask: ring_count - 1,
                workers,
                idle: config.idle,
                stop: AtomicBool::new(false),
                parked: AtomicUsize::new(0),
                state: Mutex::new(SchedState {
                    permits: 0,
                    live: 0,
                }),
                wake_cv: Condvar::new(),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the workers. `dispatch` runs on worker threads for every
    /// event; `on_panic` observes caught dispatch faults. Subsequent calls
    /// are a no-op.
    pub fn start(&self, dispatch: DispatchFn<T>, on_panic: Option<PanicCallback>) {
        let mut handles = self.handles.lock().unwrap();
        if !handles.is_empty() {
            return;
        }

        let ring_count = self.inner.ring_mask + 1;
        self.inner.state.lock().unwrap().live = self.inner.workers;
        tracing::debug!(
            workers = self.inner.workers,
            rings = ring_count,
            "scheduler starting"
        );

        for id in 0..self.inner.workers {
            let inner = Arc::clone(&self.inner);
            let dispatch = Arc::clone(&dispatch);
            let on_panic = on_panic.clone();
            let owned: Vec<usize> = (id..ring_count).step_by(self.inner.workers).collect();
            handles.push(thread::spawn(move || {
                inner.worker_run(id, &owned, &dispatch, on_panic.as_ref());
            }));
        }
    }

    /// Enqueues an event onto the calling thread's ring.
    ///
    /// Wait-free when the ring has space. A full ring degrades to yield
    /// and retry. After shutdown has begun, submissions are dropped.
    pub fn submit(&self, item: T) {
        let inner = &self.inner;
        if inner.stop.load(Ordering::Acquire) {
            return;
        }

        let token = producer_token();
        let shard = &inner.shards[token & inner.ring_mask];
        let mut item = item;
        loop {
            shard.gate.acquire();
            let res = shard.ring.push(item);
            shard.gate.release();
            match res {
                Ok(()) => break,
                Err(back) => {
                    item = back;
                    thread::yield_now();
                    if inner.stop.load(Ordering::Acquire) {
                        return;
                    }
                }
            }
        }

        if inner.parked.load(Ordering::SeqCst) > 0 {
            inner.wake_one();
        }
    }

    /// Total backlog across all rings.
    #[must_use]
    pub fn depth(&self) -> u64 {
        self.inner.shards.iter().map(|s| s.ring.len()).sum()
    }

    /// Stops the scheduler and waits for workers to drain and exit.
    ///
    /// With `None` this blocks until every worker is gone and always
    /// returns true. With a deadline it returns false if workers are still
    /// live when the deadline passes (they keep winding down in the
    /// background).
    pub fn shutdown(&self, timeout: Option<Duration>) -> bool {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.wake_cv.notify_all();

        let deadline = timeout.map(|t| Instant::now() + t);
        {
            let mut st = self.inner.state.lock().unwrap();
            while st.live > 0 {
                match deadline {
                    Some(d) => {
                        let now = Instant::now();
                        if now >= d {
                            return false;
                        }
                        let (guard, _timeout) =
                            self.inner.wake_cv.wait_timeout(st, d - now).unwrap();
                        st = guard;
                    }
                    None => {
                        st = self.inner.wake_cv.wait(st).unwrap();
                    }
                }
            }
        }

        for handle in self.handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        tracing::debug!("scheduler stopped");
        true
    }
}

impl<T> std::fmt::Debug for ShardedScheduler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedScheduler")
            .field("rings", &(self.inner.ring_mask + 1))
            .field("workers", &self.inner.workers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn counting_scheduler(
        cfg: &SchedConfig,
    ) -> (ShardedScheduler<u64>, Arc<AtomicU64>) {
        let sched = ShardedScheduler::new(cfg);
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        sched.start(
            Arc::new(move |_item| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );
        (sched, count)
    }

    #[test]
    fn test_submit_dispatches_all() {
        let (sched, count) = counting_scheduler(&SchedConfig::default());
        for i in 0..10_000 {
            sched.submit(i);
        }
        assert!(sched.shutdown(Some(Duration::from_secs(5))));
        assert_eq!(count.load(Ordering::SeqCst), 10_000);
    }

    #[test]
    fn test_multi_producer_delivery() {
        const THREADS: u64 = 16;
        const PER_THREAD: u64 = 5_000;

        let (sched, count) = counting_scheduler(&SchedConfig::default());
        let sched = Arc::new(sched);

        let producers: Vec<_> = (0..THREADS)
            .map(|_| {
                let sched = Arc::clone(&sched);
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        sched.submit(i);
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        assert!(sched.shutdown(Some(Duration::from_secs(10))));
        assert_eq!(count.load(Ordering::SeqCst), THREADS * PER_THREAD);
    }

    #[test]
    fn test_wake_after_park() {
        // Tiny idle thresholds force workers to park almost immediately.
        let cfg = SchedConfig {
            idle: IdleConfig {
                spin_limit: 2,
                yield_limit: 2,
            },
            ..SchedConfig::default()
        };
        let (sched, count) = counting_scheduler(&cfg);

        // Give workers time to run out of idle budget and park.
        thread::sleep(Duration::from_millis(100));
        sched.submit(1);
        sched.submit(2);

        let deadline = Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
        sched.shutdown(None);
    }

    #[test]
    fn test_panic_isolated_and_counted() {
        let sched: ShardedScheduler<u64> = ShardedScheduler::new(&SchedConfig::default());
        let processed = Arc::new(AtomicU64::new(0));
        let panics = Arc::new(AtomicU64::new(0));

        let p = Arc::clone(&processed);
        let pc = Arc::clone(&panics);
        sched.start(
            Arc::new(move |item: u64| {
                if item == 13 {
                    panic!("unlucky");
                }
                p.fetch_add(1, Ordering::SeqCst);
            }),
            Some(Arc::new(move |_msg| {
                pc.fetch_add(1, Ordering::SeqCst);
            })),
        );

        for i in 0..100 {
            sched.submit(i);
        }
        assert!(sched.shutdown(Some(Duration::from_secs(5))));
        assert_eq!(processed.load(Ordering::SeqCst), 99);
        assert_eq!(panics.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submit_after_shutdown_is_dropped() {
        let (sched, count) = counting_scheduler(&SchedConfig::default());
        sched.submit(1);
        sched.shutdown(None);
        let before = count.load(Ordering::SeqCst);
        sched.submit(2);
        sched.submit(3);
        assert_eq!(count.load(Ordering::SeqCst), before);
    }

    #[test]
    fn test_shutdown_timeout_with_slow_dispatch() {
        let sched: ShardedScheduler<u64> = ShardedScheduler::new(&SchedConfig::default());
        sched.start(
            Arc::new(|_item| {
                thread::sleep(Duration::from_millis(50));
            }),
            None,
        );
        for i in 0..10 {
            sched.submit(i);
        }
        // Workers cannot finish the backlog in a millisecond.
        assert!(!sched.shutdown(Some(Duration::from_millis(1))));
        // A blocking shutdown afterwards still completes.
        assert!(sched.shutdown(None));
    }

    #[test]
    fn test_depth_reflects_backlog() {
        let sched: ShardedScheduler<u64> = ShardedScheduler::new(&SchedConfig::default());
        // No workers started: everything stays queued.
        for i in 0..64 {
            sched.submit(i);
        }
        assert_eq!(sched.depth(), 64);
    }

    #[test]
    fn test_producer_token_is_stable() {
        let a = producer_token();
        let b = producer_token();
        assert_eq!(a, b);

        let other = thread::spawn(producer_token).join().unwrap();
        assert_ne!(a, other);
    }
}
