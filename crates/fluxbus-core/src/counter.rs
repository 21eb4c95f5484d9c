//! Sharded per-core counters.
//!
//! A single global atomic would serialize every emit on one cache line.
//! [`PerCoreCounter`] spreads increments across cache-line-padded slots and
//! sums them on read. Slot selection hashes the address of a stack local,
//! which lands different threads on different slots without any registry.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Upper bound on slot count, covering large core counts.
const MAX_SLOTS: usize = 256;

/// Lower bound on slot count.
///
/// On low-core machines (2 to 4 logical CPUs) the stack-address hash would
/// collide constantly with only core-count slots; eight slots keeps the
/// collision rate tolerable.
const MIN_SLOTS: usize = 8;

/// Stacks are at least 8 KiB apart, so dropping the low 13 bits of a stack
/// address separates threads.
const SLOT_SHIFT: usize = 13;

/// A write-sharded counter whose `read` sums all slots.
///
/// Increments are `Relaxed`; the sum is a point-in-time snapshot, which is
/// all the stats surface promises.
pub struct PerCoreCounter {
    slots: Box<[CachePadded<AtomicU64>]>,
    mask: usize,
}

impl PerCoreCounter {
    /// Creates a counter sized to the logical CPU count, clamped to
    /// `[8, 256]` slots and rounded up to a power of two.
    #[must_use]
    pub fn new() -> Self {
        let slots = num_cpus::get()
            .next_power_of_two()
            .clamp(MIN_SLOTS, MAX_SLOTS);
        Self {
            slots: (0..slots)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            mask: slots - 1,
        }
    }

    /// Adds `delta` to this thread's slot.
    #[inline]
    pub fn add(&self, delta: u64) {
        let probe = 0_u8;
        let slot = (std::ptr::addr_of!(probe) as usize) >> SLOT_SHIFT;
        self.slots[slot & self.mask].fetch_add(delta, Ordering::Relaxed);
    }

    /// Sums all slots.
    #[must_use]
    pub fn read(&self) -> u64 {
        self.slots
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for PerCoreCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PerCoreCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerCoreCounter")
            .field("slots", &(self.mask + 1))
            .field("value", &self.read())
            .finish()
    }
}
