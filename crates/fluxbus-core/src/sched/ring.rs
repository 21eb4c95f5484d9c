//! Wait-free SPSC ring buffer.
//!
//! Head and tail are monotonic 64-bit indices; the slot position is
//! `index & mask`. Every slot is usable: occupancy is `tail - head` and
//! ranges over `[0, capacity]`.
//!
//! Each side keeps a local cache of the peer's index (`cached_head` on the
//! producer side, `cached_tail` on the consumer side) and reloads it from
//! the shared atomic only when the cache says full or empty. In steady
//! state neither side touches the other's cache line.
//!
//! ## Safety contract
//!
//! At most one thread may call [`push`](SpscRing::push) and at most one
//! thread may call [`pop`](SpscRing::pop) at any instant. The scheduler
//! enforces this with per-ring producer gates and static worker affinity.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Producer-owned index pair: shared `tail` plus the local head cache.
struct ProducerSide {
    tail: AtomicU64,
    cached_head: UnsafeCell<u64>,
}

/// Consumer-owned index pair: shared `head` plus the local tail cache.
struct ConsumerSide {
    head: AtomicU64,
    cached_tail: UnsafeCell<u64>,
}

/// A bounded single-producer single-consumer ring.
///
/// The happy path on both sides is one relaxed load, one plain slot access
/// and one release store. No compare-and-swap anywhere.
pub struct SpscRing<T> {
    consumer: CachePadded<ConsumerSide>,
    producer: CachePadded<ProducerSide>,
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: u64,
}

// SAFETY: the ring is shared between exactly one producer and one consumer
// thread (the documented contract). Index handoff is Release/Acquire, so
// the consumer observes a slot's contents only after the producer published
// them, and vice versa for slot reuse. The UnsafeCell caches are only ever
// touched by their owning side.
#[allow(unsafe_code)]
unsafe impl<T: Send> Send for SpscRing<T> {}
#[allow(unsafe_code)]
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    /// Creates a ring with the given capacity, rounded up to a power of two.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        let capacity = capacity.next_power_of_two();

        let buf: Vec<UnsafeCell<MaybeUninit<T>>> = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        Self {
            consumer: CachePadded::new(ConsumerSide {
                head: AtomicU64::new(0),
                cached_tail: UnsafeCell::new(0),
            }),
            producer: CachePadded::new(ProducerSide {
                tail: AtomicU64::new(0),
                cached_head: UnsafeCell::new(0),
            }),
            buf: buf.into_boxed_slice(),
            mask: capacity as u64 - 1,
        }
    }

    /// Returns the ring capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        (self.mask + 1) as usize
    }

    /// Current occupancy, `tail - head`. A racy snapshot.
    #[must_use]
    pub fn len(&self) -> u64 {
        let tail = self.producer.tail.load(Ordering::Acquire);
        let head = self.consumer.head.load(Ordering::Acquire);
        tail.saturating_sub(head)
    }

    /// Whether the ring is currently empty. A racy snapshot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues an item, or hands it back if the ring is full.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` when occupancy is at capacity.
    ///
    /// # Safety contract
    ///
    /// Must only be called by the single producer.
    pub fn push(&self, item: T) -> Result<(), T> {
        let tail = self.producer.tail.load(Ordering::Relaxed);

        // SAFETY: cached_head belongs to the producer side and we are the
        // single producer.
        let cached_head = unsafe { &mut *self.producer.cached_head.get() };
        if tail - *cached_head > self.mask {
            // The cache says full; refresh from the shared head.
            *cached_head = self.consumer.head.load(Ordering::Acquire);
            if tail - *cached_head > self.mask {
                return Err(item);
            }
        }

        // SAFETY: the slot at `tail & mask` is owned by the producer until
        // the tail store below. The consumer only reads slots with index
        // strictly below the published tail.
        unsafe {
            (*self.buf[(tail & self.mask) as usize].get()).write(item);
        }
        self.producer.tail.store(tail + 1, Ordering::Release);
        Ok(())
    }

    /// Dequeues an item, or `None` if the ring is empty.
    ///
    /// # Safety contract
    ///
    /// Must only be called by the single consumer.
    pub fn pop(&self) -> Option<T> {
        let head = self.consumer.head.load(Ordering::Relaxed);

        // SAFETY: cached_tail belongs to the consumer side and we are the
        // single consumer.
        let cached_tail = unsafe { &mut *self.consumer.cached_tail.get() };
        if head == *cached_tail {
            // The cache says empty; refresh from the shared tail.
            *cached_tail = self.producer.tail.load(Ordering::Acquire);
            if head == *cached_tail {
                return None;
            }
        }

        // SAFETY: head < tail, so the producer has published this slot and
        // will not touch it again until we advance head. Reading by move
        // leaves the slot logically empty.
        let item = unsafe { (*self.buf[(head & self.mask) as usize].get()).assume_init_read() };
        self.consumer.head.store(head + 1, Ordering::Release);
        Some(item)
    }

    /// Dequeues up to `max` items, invoking `f` for each.
    ///
    /// Stops when the ring is empty, `max` items have been consumed, or
    /// `f` returns `false`. Returns the number of items consumed. The
    /// peer tail is refreshed at most once per call, which is the saving
    /// over calling [`pop`](Self::pop) in a loop.
    ///
    /// # Safety contract
    ///
    /// Must only be called by the single consumer.
    pub fn pop_each<F>(&self, max: usize, mut f: F) -> usize
    where
        F: FnMut(T) -> bool,
    {
        if max == 0 {
            return 0;
        }

        let head = self.consumer.head.load(Ordering::Relaxed);

        // SAFETY: cached_tail belongs to the consumer side and we are the
        // single consumer.
        let cached_tail = unsafe { &mut *self.consumer.cached_tail.get() };
        if head == *cached_tail {
            *cached_tail = self.producer.tail.load(Ordering::Acquire);
            if head == *cached_tail {
                return 0;
            }
        }

        let available = (*cached_tail - head) as usize;
        let limit = available.min(max);
        let mut consumed = 0;
        while consumed < limit {
            let idx = head + consumed as u64;
            // SAFETY: idx < cached_tail <= published tail, so the slot is
            // published and exclusively ours until head advances.
            let item = unsafe { (*self.buf[(idx & self.mask) as usize].get()).assume_init_read() };
            // Retire the slot before running the callback; a callback that
            // unwinds must not leave a moved-out value redeliverable.
            self.consumer.head.store(idx + 1, Ordering::Release);
            consumed += 1;
            if !f(item) {
                break;
            }
        }

        consumed
    }

    /// Dequeues into a caller-provided buffer without allocating.
    ///
    /// Returns the number of items written, starting at `buffer[0]`.
    ///
    /// # Safety contract
    ///
    /// Must only be called by the single consumer. After a return of `n`,
    /// the first `n` elements of `buffer` are initialized.
    pub fn pop_batch_into(&self, buffer: &mut [MaybeUninit<T>]) -> usize {
        let mut slot = 0;
        let n = self.pop_each(buffer.len(), |item| {
            buffer[slot].write(item);
            slot += 1;
            true
        });
        debug_assert_eq!(n, slot);
        n
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl<T> std::fmt::Debug for SpscRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpscRing")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_capacity_rounds_up() {
        let ring: SpscRing<u32> = SpscRing::new(100);
        assert_eq!(ring.capacity(), 128);
    }

    #[test]
    fn test_all_slots_usable() {
        let ring: SpscRing<u32> = SpscRing::new(4);
        for i in 0..4 {
            assert!(ring.push(i).is_ok());
        }
        // Occupancy equals capacity, not capacity minus one.
        assert_eq!(ring.len(), 4);
        assert!(ring.push(99).is_err());
        assert_eq!(ring.pop(), Some(0));
        assert!(ring.push(99).is_ok());
    }

    #[test]
    fn test_fifo_order() {
        let ring: SpscRing<u32> = SpscRing::new(16);
        for i in 0..10 {
            ring.push(i).unwrap();
        }
        for i in 0..10 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_wrap_around() {
        let ring: SpscRing<u64> = SpscRing::new(4);
        for round in 0..10 {
            for i in 0..4 {
                ring.push(round * 10 + i).unwrap();
            }
            for i in 0..4 {
                assert_eq!(ring.pop(), Some(round * 10 + i));
            }
        }
    }

    #[test]
    fn test_occupancy_bounds_during_transfer() {
        const ITEMS: u64 = 100_000;
        let ring = Arc::new(SpscRing::<u64>::new(256));

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 0..ITEMS {
                    let mut v = i;
                    loop {
                        match ring.push(v) {
                            Ok(()) => break,
                            Err(back) => {
                                v = back;
                                thread::yield_now();
                            }
                        }
                    }
                }
            })
        };

        let observer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for _ in 0..10_000 {
                    let len = ring.len();
                    assert!(len <= ring.capacity() as u64);
                }
            })
        };

        let mut received = 0_u64;
        let mut expected = 0_u64;
        while received < ITEMS {
            if let Some(v) = ring.pop() {
                assert_eq!(v, expected);
                expected += 1;
                received += 1;
            } else {
                thread::yield_now();
            }
        }

        producer.join().unwrap();
        observer.join().unwrap();
    }

    #[derive(Debug)]
    struct DropCounter(Arc<AtomicUsize>);
    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_drop_releases_queued_items() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let ring: SpscRing<DropCounter> = SpscRing::new(8);
            for _ in 0..5 {
                ring.push(DropCounter(Arc::clone(&drops))).unwrap();
            }
            ring.pop();
            ring.pop();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn test_zero_capacity_panics() {
        let _: SpscRing<u8> = SpscRing::new(0);
    }

    #[test]
    fn test_pop_each_consumes_and_sums() {
        let ring: SpscRing<u64> = SpscRing::new(16);
        for i in 1..=5 {
            ring.push(i).unwrap();
        }

        let mut sum = 0;
        let n = ring.pop_each(10, |v| {
            sum += v;
            true
        });
        assert_eq!(n, 5);
        assert_eq!(sum, 15);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_pop_each_early_stop_keeps_remainder() {
        let ring: SpscRing<u64> = SpscRing::new(16);
        for i in 0..6 {
            ring.push(i).unwrap();
        }

        let mut got = Vec::new();
        let n = ring.pop_each(10, |v| {
            got.push(v);
            v < 2
        });
        assert_eq!(n, 3);
        assert_eq!(got, vec![0, 1, 2]);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.pop(), Some(3));
    }

    #[test]
    fn test_pop_each_max_and_zero() {
        let ring: SpscRing<u64> = SpscRing::new(16);
        for i in 0..8 {
            ring.push(i).unwrap();
        }
        assert_eq!(ring.pop_each(0, |_| true), 0);
        assert_eq!(ring.pop_each(3, |_| true), 3);
        assert_eq!(ring.len(), 5);
    }

    #[test]
    fn test_pop_each_unwind_does_not_redeliver() {
        let ring = SpscRing::<u64>::new(16);
        for i in 0..4 {
            ring.push(i).unwrap();
        }

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ring.pop_each(10, |v| {
                assert!(v != 1, "boom");
                true
            });
        }));
        assert!(result.is_err());
        // Items 0 and 1 are gone for good; 2 and 3 are still queued.
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_pop_batch_into() {
        let ring: SpscRing<u32> = SpscRing::new(16);
        for i in 0..3 {
            ring.push(i).unwrap();
        }

        let mut buffer: [MaybeUninit<u32>; 8] = [MaybeUninit::uninit(); 8];
        let n = ring.pop_batch_into(&mut buffer);
        assert_eq!(n, 3);
        // SAFETY: the first n elements were just initialized.
        unsafe {
            assert_eq!(buffer[0].assume_init(), 0);
            assert_eq!(buffer[1].assume_init(), 1);
            assert_eq!(buffer[2].assume_init(), 2);
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_pop_batch_into_empty_buffer() {
        let ring: SpscRing<u32> = SpscRing::new(16);
        ring.push(9).unwrap();
        let mut buffer: [MaybeUninit<u32>; 0] = [];
        assert_eq!(ring.pop_batch_into(&mut buffer), 0);
        assert_eq!(ring.len(), 1);
    }
}
