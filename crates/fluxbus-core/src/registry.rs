//! Subscription registry and copy-on-write snapshots.
//!
//! Every subscribe/unsubscribe rebuilds an immutable [`SubSnapshot`] and
//! publishes it through an [`RcuCell`]. The snapshot carries two views of
//! the same data:
//!
//! - `by_id`: the authoritative per-pattern subscription lists, including
//!   ids. Touched only while rebuilding.
//! - `handlers`: pre-flattened handler slices per pattern. This is what
//!   dispatch iterates; there is no indirection back to subscription
//!   records.
//!
//! When exactly one pattern is subscribed the snapshot also carries a
//! `single` entry, letting dispatch skip the map lookup entirely.
//!
//! Rebuild cost is linear in the number of subscriptions. That is a
//! deliberate trade: the read side (one acquire load plus one map lookup)
//! is the critical path, and subscriptions are control-plane operations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use fxhash::FxHashMap;

use crate::event::Handler;
use crate::matcher::TrieMatcher;
use crate::rcu::RcuCell;

/// Process-global subscription id source. Ids are never reused.
static NEXT_SUB_ID: AtomicU64 = AtomicU64::new(1);

/// One subscription inside a snapshot's `by_id` list.
#[derive(Clone)]
pub(crate) struct SubEntry {
    pub id: u64,
    pub handler: Handler,
}

/// An immutable view of all current subscriptions.
#[derive(Default)]
pub(crate) struct SubSnapshot {
    /// Authoritative lists, keyed by pattern. Rebuild-only.
    pub by_id: FxHashMap<Arc<str>, Vec<SubEntry>>,
    /// Flattened handler slices, keyed by pattern. The dispatch view.
    pub handlers: FxHashMap<Arc<str>, Box<[Handler]>>,
    /// Set iff exactly one pattern is subscribed.
    pub single: Option<(Arc<str>, Box<[Handler]>)>,
    /// Whether any subscribed pattern contains a wildcard.
    pub has_wildcard: bool,
}

impl SubSnapshot {
    /// Builds the dispatch views from an authoritative map.
    fn build(by_id: FxHashMap<Arc<str>, Vec<SubEntry>>) -> Self {
        let mut handlers = FxHashMap::with_capacity_and_hasher(by_id.len(), Default::default());
        let mut has_wildcard = false;
        for (pattern, subs) in &by_id {
            let flat: Box<[Handler]> = subs.iter().map(|s| Arc::clone(&s.handler)).collect();
            handlers.insert(Arc::clone(pattern), flat);
            has_wildcard = has_wildcard || pattern.contains('*');
        }

        let single = if by_id.len() == 1 {
            handlers
                .iter()
                .next()
                .map(|(k, v)| (Arc::clone(k), v.clone()))
        } else {
            None
        };

        Self {
            by_id,
            handlers,
            single,
            has_wildcard,
        }
    }

    /// Handlers for an exact event type: the single-key fast path when it
    /// applies, otherwise the map lookup. Never allocates.
    #[inline]
    pub fn handlers_for(&self, event_type: &str) -> &[Handler] {
        if let Some((key, flat)) = &self.single {
            if key.as_ref() == event_type {
                return flat;
            }
        }
        self.handlers.get(event_type).map_or(&[], |flat| &flat[..])
    }

    /// Handlers registered under a pattern key, as returned by the matcher.
    #[inline]
    pub fn handlers_for_pattern(&self, pattern: &str) -> &[Handler] {
        self.handlers.get(pattern).map_or(&[], |flat| &flat[..])
    }
}

/// The shared subscription substrate: snapshot cell, matcher, writer lock.
///
/// All three bus variants own one of these. Readers go straight to the
/// cell; `subscribe`/`unsubscribe` serialize on the internal mutex.
pub(crate) struct SubscriberCore {
    snapshot: RcuCell<SubSnapshot>,
    pub matcher: TrieMatcher,
    write_lock: Mutex<()>,
}

// Writer-lock poisoning means a panic escaped a rebuild, which only touches
// plain maps; nothing to salvage beyond propagating.
#[allow(clippy::missing_panics_doc)]
impl SubscriberCore {
    pub fn new() -> Self {
        Self {
            snapshot: RcuCell::new(SubSnapshot::default()),
            matcher: TrieMatcher::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// The snapshot cell, for dispatch paths.
    #[inline]
    pub fn snapshot(&self) -> &RcuCell<SubSnapshot> {
        &self.snapshot
    }

    /// Registers a handler under a pattern, returning the subscription id.
    pub fn subscribe(&self, pattern: &str, handler: Handler) -> u64 {
        let id = NEXT_SUB_ID.fetch_add(1, Ordering::Relaxed);

        let _writer = self.write_lock.lock().unwrap();
        let guard = RcuCell::<SubSnapshot>::pin();
        let old = self.snapshot.load(&guard);

        let mut by_id = old.by_id.clone();
        // Reuse the existing key allocation when the pattern is known.
        let key = by_id
            .keys()
            .find(|k| k.as_ref() == pattern)
            .cloned()
            .unwrap_or_else(|| Arc::from(pattern));
        by_id.entry(key).or_default().push(SubEntry { id, handler });

        self.snapshot.store(SubSnapshot::build(by_id));
        self.matcher.add(pattern);
        id
    }

    /// Removes a subscription by id. Unknown ids are a no-op.
    pub fn unsubscribe(&self, id: u64) {
        let _writer = self.write_lock.lock().unwrap();
        let guard = RcuCell::<SubSnapshot>::pin();
        let old = self.snapshot.load(&guard);

        let mut by_id: FxHashMap<Arc<str>, Vec<SubEntry>> =
            FxHashMap::with_capacity_and_hasher(old.by_id.len(), Default::default());
        for (pattern, subs) in &old.by_id {
            // Survivors keep their relative order.
            let filtered: Vec<SubEntry> =
                subs.iter().filter(|s| s.id != id).cloned().collect();
            if filtered.is_empty() {
                // Matcher ref-count parity: one remove per subscription
                // that had added this pattern.
                for _ in 0..subs.len() {
                    self.matcher.remove(pattern);
                }
            } else {
                by_id.insert(Arc::clone(pattern), filtered);
            }
        }

        self.snapshot.store(SubSnapshot::build(by_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: &Arc<AtomicUsize>) -> Handler {
        let counter = Arc::clone(counter);
        Arc::new(move |_evt| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_ids_monotonic_and_unique() {
        let core = SubscriberCore::new();
        let h: Handler = Arc::new(|_| Ok(()));
        let a = core.subscribe("x", Arc::clone(&h));
        let b = core.subscribe("x", Arc::clone(&h));
        let c = core.subscribe("y", h);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_single_key_fast_path_set() {
        let core = SubscriberCore::new();
        core.subscribe("only.key", Arc::new(|_| Ok(())));

        let guard = RcuCell::<SubSnapshot>::pin();
        let snap = core.snapshot().load(&guard);
        let (key, flat) = snap.single.as_ref().expect("single set");
        assert_eq!(key.as_ref(), "only.key");
        assert_eq!(flat.len(), 1);
        assert_eq!(snap.handlers_for("only.key").len(), 1);
        assert!(snap.handlers_for("other").is_empty());
    }

    #[test]
    fn test_single_key_cleared_with_second_pattern() {
        let core = SubscriberCore::new();
        core.subscribe("a", Arc::new(|_| Ok(())));
        core.subscribe("b", Arc::new(|_| Ok(())));

        let guard = RcuCell::<SubSnapshot>::pin();
        let snap = core.snapshot().load(&guard);
        assert!(snap.single.is_none());
        assert_eq!(snap.handlers_for("a").len(), 1);
        assert_eq!(snap.handlers_for("b").len(), 1);
    }

    #[test]
    fn test_has_wildcard_flag() {
        let core = SubscriberCore::new();
        core.subscribe("plain.key", Arc::new(|_| Ok(())));
        {
            let guard = RcuCell::<SubSnapshot>::pin();
            assert!(!core.snapshot().load(&guard).has_wildcard);
        }
        let id = core.subscribe("wild.*", Arc::new(|_| Ok(())));
        {
            let guard = RcuCell::<SubSnapshot>::pin();
            assert!(core.snapshot().load(&guard).has_wildcard);
        }
        core.unsubscribe(id);
        {
            let guard = RcuCell::<SubSnapshot>::pin();
            assert!(!core.snapshot().load(&guard).has_wildcard);
        }
    }

    #[test]
    fn test_unsubscribe_preserves_survivor_order() {
        let core = SubscriberCore::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let make = |tag: &'static str| -> Handler {
            let hits = Arc::clone(&hits);
            Arc::new(move |_evt| {
                hits.lock().unwrap().push(tag);
                Ok(())
            })
        };
        core.subscribe("k", make("first"));
        let mid = core.subscribe("k", make("second"));
        core.subscribe("k", make("third"));
        core.unsubscribe(mid);

        let guard = RcuCell::<SubSnapshot>::pin();
        let snap = core.snapshot().load(&guard);
        let evt = crate::event::Event::new("k", "");
        for h in snap.handlers_for("k") {
            (**h)(&evt).unwrap();
        }
        assert_eq!(*hits.lock().unwrap(), ["first", "third"]);
    }

    #[test]
    fn test_unsubscribe_last_clears_pattern_and_matcher() {
        let core = SubscriberCore::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = core.subscribe("gone.soon", counting_handler(&counter));
        assert!(core.matcher.has_match("gone.soon"));

        core.unsubscribe(id);
        assert!(!core.matcher.has_match("gone.soon"));
        let guard = RcuCell::<SubSnapshot>::pin();
        let snap = core.snapshot().load(&guard);
        assert!(snap.handlers_for("gone.soon").is_empty());
        assert!(snap.by_id.is_empty());
    }

    #[test]
    fn test_unsubscribe_unknown_id_noop() {
        let core = SubscriberCore::new();
        core.subscribe("keep", Arc::new(|_| Ok(())));
        core.unsubscribe(u64::MAX);
        let guard = RcuCell::<SubSnapshot>::pin();
        assert_eq!(core.snapshot().load(&guard).handlers_for("keep").len(), 1);
    }

    #[test]
    fn test_readers_see_consistent_snapshots_during_churn() {
        use std::thread;

        let core = Arc::new(SubscriberCore::new());
        core.subscribe("stable", Arc::new(|_| Ok(())));

        let stop = Arc::new(AtomicUsize::new(0));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let core = Arc::clone(&core);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while stop.load(Ordering::Acquire) == 0 {
                        let guard = RcuCell::<SubSnapshot>::pin();
                        let snap = core.snapshot().load(&guard);
                        // The stable subscription is always visible.
                        assert_eq!(snap.handlers_for("stable").len(), 1);
                        // Flattened lists agree with by_id lengths.
                        for (k, subs) in &snap.by_id {
                            assert_eq!(snap.handlers_for_pattern(k).len(), subs.len());
                        }
                    }
                })
            })
            .collect();

        for _ in 0..300 {
            let id = core.subscribe("churn.key", Arc::new(|_| Ok(())));
            core.unsubscribe(id);
        }
        stop.store(1, Ordering::Release);
        for r in readers {
            r.join().unwrap();
        }
    }
}
