//! Optional bump-allocating arena for event payloads.
//!
//! Producers that fill many small payloads per second can skip the global
//! allocator: the arena hands out slices of 64 KiB chunks via
//! `BytesMut::split_to`, which is a pointer bump on a shared allocation.
//! A chunk whose remaining space cannot satisfy a request is retired to a
//! free pool and recycled once every slice split off from it has dropped.
//!
//! The arena is a support facility: nothing in the bus requires it, and
//! oversized or post-ceiling requests silently fall back to plain
//! allocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use bytes::BytesMut;

/// Chunk size backing arena allocations.
pub const ARENA_CHUNK_SIZE: usize = 64 * 1024;

/// Live chunk ceiling (16 MiB total). Beyond it requests bypass the arena.
const MAX_CHUNKS: u32 = 256;

/// Retired chunks kept for recycling.
const FREE_POOL_LIMIT: usize = 8;

struct ArenaInner {
    current: BytesMut,
    allocated_chunks: u32,
    free: Vec<BytesMut>,
}

impl ArenaInner {
    /// Finds a retired chunk that is fully released and resets it.
    fn recycle(&mut self) -> Option<BytesMut> {
        for i in 0..self.free.len() {
            let candidate = &mut self.free[i];
            candidate.clear();
            if candidate.try_reclaim(ARENA_CHUNK_SIZE) {
                let mut chunk = self.free.swap_remove(i);
                chunk.resize(ARENA_CHUNK_SIZE, 0);
                return Some(chunk);
            }
        }
        None
    }
}

/// Point-in-time arena accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Chunks ever allocated and not yet recycled away.
    pub allocated_chunks: u32,
    /// Retired chunks waiting in the recycle pool.
    pub free_chunks: usize,
    /// Unallocated bytes left in the live chunk.
    pub current_remaining: usize,
}

/// A pool of fixed-size bump chunks.
pub struct ArenaPool {
    enabled: AtomicBool,
    inner: Mutex<ArenaInner>,
}

#[allow(clippy::missing_panics_doc)] // mutex poisoning only
impl ArenaPool {
    /// Creates a pool with one live chunk.
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            inner: Mutex::new(ArenaInner {
                current: BytesMut::zeroed(ARENA_CHUNK_SIZE),
                allocated_chunks: 1,
                free: Vec::new(),
            }),
        }
    }

    /// Turns arena allocation on or off. When off, [`alloc`](Self::alloc)
    /// is a plain allocation.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Whether arena allocation is active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Returns a point-in-time view of chunk accounting.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        let inner = self.inner.lock().unwrap();
        ArenaStats {
            allocated_chunks: inner.allocated_chunks,
            free_chunks: inner.free.len(),
            current_remaining: inner.current.len(),
        }
    }

    /// Returns a zeroed writable buffer of `len` bytes.
    ///
    /// Arena-backed when enabled and `len` is at most half a chunk;
    /// otherwise a plain allocation. Freeze the result into `Bytes` for an
    /// event payload.
    #[must_use]
    pub fn alloc(&self, len: usize) -> BytesMut {
        if !self.is_enabled() || len > ARENA_CHUNK_SIZE / 2 {
            return BytesMut::zeroed(len);
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.current.len() < len {
            // Retire the exhausted chunk and find a replacement.
            let replacement = if let Some(chunk) = inner.recycle() {
                Some(chunk)
            } else if inner.allocated_chunks < MAX_CHUNKS {
                inner.allocated_chunks += 1;
                Some(BytesMut::zeroed(ARENA_CHUNK_SIZE))
            } else {
                None
            };

            let Some(fresh) = replacement else {
                // Ceiling reached and nothing reclaimable.
                drop(inner);
                return BytesMut::zeroed(len);
            };

            let retired = std::mem::replace(&mut inner.current, fresh);
            if inner.free.len() >= FREE_POOL_LIMIT {
                inner.free.remove(0);
            }
            inner.free.push(retired);
        }

        inner.current.split_to(len)
    }
}

impl Default for ArenaPool {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: OnceLock<ArenaPool> = OnceLock::new();

/// The process-wide arena used by the bus factories.
pub fn global() -> &'static ArenaPool {
    GLOBAL.get_or_init(ArenaPool::new)
}

/// Toggles the process-wide arena.
pub fn set_enabled(enabled: bool) {
    global().set_enabled(enabled);
}

/// Allocates a payload buffer from the process-wide arena.
#[must_use]
pub fn alloc(len: usize) -> BytesMut {
    global().alloc(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_is_plain_allocation() {
        let pool = ArenaPool::new();
        let buf = pool.alloc(128);
        assert_eq!(buf.len(), 128);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_enabled_bump_allocations_are_disjoint() {
        let pool = ArenaPool::new();
        pool.set_enabled(true);

        let mut a = pool.alloc(64);
        let mut b = pool.alloc(64);
        a.fill(1);
        b.fill(2);
        assert!(a.iter().all(|&x| x == 1));
        assert!(b.iter().all(|&x| x == 2));
    }

    #[test]
    fn test_oversized_bypasses_arena() {
        let pool = ArenaPool::new();
        pool.set_enabled(true);
        let buf = pool.alloc(ARENA_CHUNK_SIZE);
        assert_eq!(buf.len(), ARENA_CHUNK_SIZE);
    }

    #[test]
    fn test_chunk_rollover() {
        let pool = ArenaPool::new();
        pool.set_enabled(true);

        // Burn through more than one chunk.
        let request = ARENA_CHUNK_SIZE / 4;
        let held: Vec<BytesMut> = (0..6).map(|_| pool.alloc(request)).collect();
        for buf in &held {
            assert_eq!(buf.len(), request);
        }
    }

    #[test]
    fn test_recycle_after_release() {
        let pool = ArenaPool::new();
        pool.set_enabled(true);

        let request = ARENA_CHUNK_SIZE / 2;
        // Two allocations exhaust a chunk; dropping them immediately
        // leaves the retired chunk fully released.
        for _ in 0..12 {
            let a = pool.alloc(request);
            let b = pool.alloc(request);
            drop((a, b));
        }

        let inner = pool.inner.lock().unwrap();
        // Recycling kept the chunk population well under one-per-request.
        assert!(inner.allocated_chunks < 12);
    }

    #[test]
    fn test_freeze_into_payload() {
        use crate::event::Event;

        let pool = ArenaPool::new();
        pool.set_enabled(true);
        let mut buf = pool.alloc(5);
        buf.copy_from_slice(b"hello");
        let evt = Event::new("x", buf.freeze());
        assert_eq!(evt.payload().as_ref(), b"hello");
    }

    #[test]
    fn test_stats_track_consumption() {
        let pool = ArenaPool::new();
        pool.set_enabled(true);

        let before = pool.stats();
        assert_eq!(before.allocated_chunks, 1);
        assert_eq!(before.current_remaining, ARENA_CHUNK_SIZE);

        let _buf = pool.alloc(1024);
        let after = pool.stats();
        assert_eq!(after.current_remaining, ARENA_CHUNK_SIZE - 1024);
    }

    #[test]
    fn test_global_toggle() {
        set_enabled(true);
        assert!(global().is_enabled());
        let buf = alloc(16);
        assert_eq!(buf.len(), 16);
        set_enabled(false);
        assert!(!global().is_enabled());
    }
}
