//! RCU pointer cell for subscription snapshots.
//!
//! Readers take a single acquire load under an epoch guard and never block;
//! writers swap in a new value and defer destruction of the old one until
//! every reader that could observe it has moved on. Writer serialization is
//! the caller's job (the registry holds a mutex across rebuild-and-store).

use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};

/// An atomically swappable cell holding an immutable value.
///
/// The cell never exposes mutable access to a published value. Each update
/// replaces the whole value; readers keep borrowing the old one until their
/// guard drops.
pub struct RcuCell<T> {
    inner: Atomic<T>,
}

impl<T: Send + Sync + 'static> RcuCell<T> {
    /// Creates a cell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Atomic::new(value),
        }
    }

    /// Pins the current thread's epoch.
    ///
    /// The returned guard bounds the lifetime of references from
    /// [`load`](Self::load).
    #[inline]
    #[must_use]
    pub fn pin() -> Guard {
        epoch::pin()
    }

    /// Loads the current value.
    ///
    /// One acquire load; the reference stays valid while `guard` lives.
    #[inline]
    pub fn load<'g>(&self, guard: &'g Guard) -> &'g T {
        let shared = self.inner.load(Ordering::Acquire, guard);
        // SAFETY: the cell is initialized non-null at construction and every
        // store swaps in another non-null value. Destruction of a replaced
        // value is deferred past all guards that could have loaded it, so
        // the reference cannot outlive the allocation.
        unsafe { shared.deref() }
    }

    /// Publishes `value`, retiring the previous one.
    ///
    /// Callers must serialize stores externally (last-writer-wins swaps are
    /// not a sensible way to rebuild snapshots).
    pub fn store(&self, value: T) {
        let guard = epoch::pin();
        let old = self.inner.swap(Owned::new(value), Ordering::AcqRel, &guard);
        // SAFETY: `old` was just unlinked and can no longer be loaded by new
        // readers; defer_destroy waits out existing guards before dropping.
        unsafe { guard.defer_destroy(old) };
    }
}

impl<T> Drop for RcuCell<T> {
    fn drop(&mut self) {
        // SAFETY: exclusive access; no guard can still reference the value.
        unsafe {
            let guard = epoch::unprotected();
            let shared = self.inner.load(Ordering::Relaxed, guard);
            if !shared.is_null() {
                drop(shared.into_owned());
            }
        }
    }
}

impl<T: Send + Sync + 'static + std::fmt::Debug> std::fmt::Debug for RcuCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = Self::pin();
        f.debug_tuple("RcuCell").field(self.load(&guard)).finish()
    }
}
