//! Trie-based wildcard pattern matcher.
//!
//! Patterns and event types are dot-separated segments. Two wildcard
//! tokens are recognized:
//!
//! - `*` matches exactly one segment (`user.*.created`)
//! - `**` matches one or more trailing segments and only as the final
//!   segment (`user.**`)
//!
//! ## Lookup tiers
//!
//! 1. **Exact set**: patterns without wildcards sit in a hash set; an event
//!    type found there matches itself without touching the trie. The hit
//!    short-circuits: wildcard patterns that would also match are not
//!    reported for exactly-subscribed event types.
//! 2. **Result cache**: 16 hash shards keyed by event type, each entry
//!    stamped with the matcher version. Add/remove bumps the version, which
//!    invalidates every cached entry at once; stale entries are overwritten
//!    in place on the next miss.
//! 3. **Trie walk**: recursive descent trying the literal segment, `*` and
//!    `**` at every depth.
//!
//! Returned pattern lists are in unspecified order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_utils::CachePadded;
use fxhash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

/// Number of result-cache shards.
const MATCH_CACHE_SHARDS: usize = 16;

/// Maximum trie depth. Removals of deeper paths are rejected so the prune
/// walk stays stack-allocated.
pub const MAX_TRIE_DEPTH: usize = 16;

/// A list of matching pattern keys. Entries are shared `Arc<str>` clones of
/// the registered pattern strings, so building a list never copies pattern
/// text.
pub type MatchList = SmallVec<[Arc<str>; 4]>;

type SegmentList<'a> = SmallVec<[&'a str; MAX_TRIE_DEPTH]>;

/// FNV-1a, picking the cache shard for an event type.
#[inline]
fn cache_shard(s: &str) -> usize {
    let mut h: u64 = 14_695_981_039_346_656_037;
    for b in s.bytes() {
        h ^= u64::from(b);
        h = h.wrapping_mul(1_099_511_628_211);
    }
    (h as usize) & (MATCH_CACHE_SHARDS - 1)
}

#[derive(Default)]
struct TrieNode {
    children: FxHashMap<Box<str>, TrieNode>,
    /// Full pattern string, set iff terminal.
    pattern: Option<Arc<str>>,
    /// Subscriptions terminating here.
    ref_count: u32,
    is_terminal: bool,
}

struct MatcherInner {
    root: TrieNode,
    /// Wildcard-free patterns, for the exact fast path.
    exact: FxHashSet<Arc<str>>,
}

#[derive(Clone)]
struct CacheEntry {
    patterns: MatchList,
    version: u64,
}

type CacheShard = CachePadded<RwLock<FxHashMap<String, CacheEntry>>>;

/// High-throughput wildcard matcher.
///
/// `match_patterns` takes a shared lock; `add`/`remove` take the exclusive
/// lock and bump the cache version. Illegal patterns (empty strings, bare
/// dots) are not validated; they are stored and matched literally.
pub struct TrieMatcher {
    inner: RwLock<MatcherInner>,
    cache: [CacheShard; MATCH_CACHE_SHARDS],
    version: AtomicU64,
}

impl Default for TrieMatcher {
    fn default() -> Self {
        Self::new()
    }
}

// Lock poisoning is the only panic source in here; a poisoned matcher means
// a handler already tore through a lock holder, and there is nothing useful
// to recover.
#[allow(clippy::missing_panics_doc)]
impl TrieMatcher {
    /// Creates an empty matcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MatcherInner {
                root: TrieNode::default(),
                exact: FxHashSet::default(),
            }),
            cache: std::array::from_fn(|_| CachePadded::new(RwLock::new(FxHashMap::default()))),
            version: AtomicU64::new(0),
        }
    }

    /// Registers a pattern. Repeated adds of the same pattern stack via a
    /// reference count on the terminal node.
    pub fn add(&self, pattern: &str) {
        let mut inner = self.inner.write().unwrap();
        let key: Arc<str> = Arc::from(pattern);

        let mut node = &mut inner.root;
        for part in pattern.split('.') {
            node = node
                .children
                .entry(Box::from(part))
                .or_insert_with(TrieNode::default);
        }
        node.is_terminal = true;
        node.pattern = Some(Arc::clone(&key));
        node.ref_count += 1;

        if !pattern.contains('*') {
            inner.exact.insert(key);
        }

        self.version.fetch_add(1, Ordering::Release);
    }

    /// Unregisters one reference to a pattern.
    ///
    /// Missing patterns are a no-op. When the terminal reference count hits
    /// zero the terminal flag clears and empty nodes are pruned bottom-up.
    /// Paths deeper than [`MAX_TRIE_DEPTH`] are rejected.
    pub fn remove(&self, pattern: &str) {
        let mut inner = self.inner.write().unwrap();
        let segments: SegmentList<'_> = pattern.split('.').collect();
        if segments.len() > MAX_TRIE_DEPTH {
            return;
        }

        if remove_recursive(&mut inner.root, &segments).is_none() {
            // Path absent: nothing changed, keep the cache.
            return;
        }

        if !pattern.contains('*') {
            inner.exact.remove(pattern);
        }

        self.version.fetch_add(1, Ordering::Release);
    }

    /// Returns every registered pattern matching `event_type`.
    pub fn match_patterns(&self, event_type: &str) -> MatchList {
        // Tier 1: exact hit, the common wildcard-free workload.
        {
            let inner = self.inner.read().unwrap();
            if let Some(key) = inner.exact.get(event_type) {
                let mut out = MatchList::new();
                out.push(Arc::clone(key));
                return out;
            }
        }

        // Tier 2: cached result still stamped with the current version.
        let version = self.version.load(Ordering::Acquire);
        let shard = &self.cache[cache_shard(event_type)];
        {
            let entries = shard.read().unwrap();
            if let Some(entry) = entries.get(event_type) {
                if entry.version == version {
                    return entry.patterns.clone();
                }
            }
        }

        // Tier 3: trie walk.
        let mut out = MatchList::new();
        {
            let inner = self.inner.read().unwrap();
            let segments: SegmentList<'_> = event_type.split('.').collect();
            match_recursive(&inner.root, &segments, &mut out);
        }

        shard.write().unwrap().insert(
            event_type.to_string(),
            CacheEntry {
                patterns: out.clone(),
                version,
            },
        );

        out
    }

    /// Returns whether any registered pattern matches `event_type`.
    ///
    /// Short-circuiting traversal with no allocation for types of up to
    /// [`MAX_TRIE_DEPTH`] segments.
    #[must_use]
    pub fn has_match(&self, event_type: &str) -> bool {
        let inner = self.inner.read().unwrap();
        if inner.exact.contains(event_type) {
            return true;
        }
        let segments: SegmentList<'_> = event_type.split('.').collect();
        has_match_recursive(&inner.root, &segments)
    }

    /// Current cache version. Test hook.
    #[cfg(test)]
    fn cache_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TrieMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrieMatcher")
            .field("version", &self.version.load(Ordering::Relaxed))
            .finish()
    }
}

/// Walks down `segments`, decrementing the terminal ref count and pruning
/// empty nodes on the way back up.
///
/// Returns `None` if the path does not exist, otherwise whether the node at
/// this level should be pruned by its parent.
fn remove_recursive(node: &mut TrieNode, segments: &[&str]) -> Option<bool> {
    if let [first, rest @ ..] = segments {
        let child = node.children.get_mut(*first)?;
        let prune_child = remove_recursive(child, rest)?;
        if prune_child {
            node.children.remove(*first);
        }
    } else {
        if node.ref_count > 0 {
            node.ref_count -= 1;
        }
        if node.ref_count == 0 {
            node.is_terminal = false;
            node.pattern = None;
        }
    }
    Some(node.ref_count == 0 && !node.is_terminal && node.children.is_empty())
}

fn match_recursive(node: &TrieNode, segments: &[&str], out: &mut MatchList) {
    let Some((first, rest)) = segments.split_first() else {
        // All segments consumed: this node matches, and so does a `**`
        // child (which also covers zero remaining segments).
        if node.is_terminal {
            if let Some(p) = &node.pattern {
                out.push(Arc::clone(p));
            }
        }
        if let Some(child) = node.children.get("**") {
            if child.is_terminal {
                if let Some(p) = &child.pattern {
                    out.push(Arc::clone(p));
                }
            }
        }
        return;
    };

    if let Some(child) = node.children.get(*first) {
        match_recursive(child, rest, out);
    }
    if let Some(child) = node.children.get("*") {
        match_recursive(child, rest, out);
    }
    // `**` swallows everything that remains, but only if terminal.
    if let Some(child) = node.children.get("**") {
        if child.is_terminal {
            if let Some(p) = &child.pattern {
                out.push(Arc::clone(p));
            }
        }
    }
}

fn has_match_recursive(node: &TrieNode, segments: &[&str]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        if node.is_terminal {
            return true;
        }
        return node
            .children
            .get("**")
            .is_some_and(|child| child.is_terminal);
    };

    if let Some(child) = node.children.get(*first) {
        if has_match_recursive(child, rest) {
            return true;
        }
    }
    if let Some(child) = node.children.get("*") {
        if has_match_recursive(child, rest) {
            return true;
        }
    }
    node.children
        .get("**")
        .is_some_and(|child| child.is_terminal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn match_set(m: &TrieMatcher, event_type: &str) -> Vec<String> {
        let mut v: Vec<String> = m
            .match_patterns(event_type)
            .iter()
            .map(|p| p.to_string())
            .collect();
        v.sort();
        v
    }

    #[test]
    fn test_exact_match() {
        let m = TrieMatcher::new();
        m.add("user.created");
        assert_eq!(match_set(&m, "user.created"), ["user.created"]);
        assert!(match_set(&m, "user.deleted").is_empty());
    }

    #[test]
    fn test_exact_only_returns_equal_patterns() {
        let m = TrieMatcher::new();
        m.add("a.b");
        m.add("a.c");
        m.add("x");
        assert_eq!(match_set(&m, "a.b"), ["a.b"]);
        assert_eq!(match_set(&m, "x"), ["x"]);
    }

    #[test]
    fn test_single_segment_wildcard() {
        let m = TrieMatcher::new();
        m.add("user.*.action.*");
        assert_eq!(
            match_set(&m, "user.123.action.login"),
            ["user.*.action.*"]
        );
        // `*` never matches across a dot.
        assert!(match_set(&m, "user.123.login").is_empty());
        assert!(match_set(&m, "user.123.action").is_empty());
    }

    #[test]
    fn test_multi_segment_wildcard() {
        let m = TrieMatcher::new();
        m.add("user.**");
        assert_eq!(match_set(&m, "user"), ["user.**"]);
        assert_eq!(match_set(&m, "user.a"), ["user.**"]);
        assert_eq!(match_set(&m, "user.a.b.c"), ["user.**"]);
        assert!(match_set(&m, "order.a").is_empty());
    }

    #[test]
    fn test_exact_hit_short_circuits_wildcards() {
        let m = TrieMatcher::new();
        m.add("user.created");
        m.add("user.*");
        m.add("user.**");
        // The exact fast path wins outright for exactly-subscribed types.
        assert_eq!(match_set(&m, "user.created"), ["user.created"]);
    }

    #[test]
    fn test_overlapping_wildcards_all_returned() {
        let m = TrieMatcher::new();
        m.add("user.*");
        m.add("user.**");
        m.add("*.updated");
        assert_eq!(
            match_set(&m, "user.updated"),
            ["*.updated", "user.*", "user.**"]
        );
    }

    #[test]
    fn test_duplicate_add_needs_matching_removes() {
        let m = TrieMatcher::new();
        m.add("a.b");
        m.add("a.b");
        m.remove("a.b");
        // One reference remains.
        assert!(m.has_match("a.b"));
        m.remove("a.b");
        assert!(!m.has_match("a.b"));
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let m = TrieMatcher::new();
        m.add("a.b");
        let v = m.cache_version();
        m.remove("a.c");
        m.remove("zz");
        assert_eq!(m.cache_version(), v);
        assert!(m.has_match("a.b"));
    }

    #[test]
    fn test_remove_prunes_but_keeps_siblings() {
        let m = TrieMatcher::new();
        m.add("a.b.c");
        m.add("a.b.d");
        m.remove("a.b.c");
        assert!(!m.has_match("a.b.c"));
        assert!(m.has_match("a.b.d"));
    }

    #[test]
    fn test_remove_keeps_shorter_terminal_on_path() {
        let m = TrieMatcher::new();
        m.add("a.b");
        m.add("a.b.c");
        m.remove("a.b.c");
        assert!(m.has_match("a.b"));
        assert!(!m.has_match("a.b.c"));
    }

    #[test]
    fn test_remove_too_deep_rejected() {
        let m = TrieMatcher::new();
        let deep = (0..MAX_TRIE_DEPTH + 1)
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(".");
        m.add(&deep);
        m.remove(&deep);
        // Removal was rejected, the pattern survives.
        assert!(m.has_match(&deep));
    }

    #[test]
    fn test_cache_invalidated_by_add() {
        let m = TrieMatcher::new();
        m.add("user.*");
        assert_eq!(match_set(&m, "user.created"), ["user.*"]);
        m.add("user.**");
        assert_eq!(
            match_set(&m, "user.created"),
            ["user.*", "user.**"]
        );
    }

    #[test]
    fn test_cache_invalidated_by_remove() {
        let m = TrieMatcher::new();
        m.add("user.*");
        m.add("user.**");
        assert_eq!(match_set(&m, "user.x"), ["user.*", "user.**"]);
        m.remove("user.*");
        assert_eq!(match_set(&m, "user.x"), ["user.**"]);
    }

    #[test]
    fn test_cache_hit_returns_same_result() {
        let m = TrieMatcher::new();
        m.add("a.*");
        let first = match_set(&m, "a.x");
        let second = match_set(&m, "a.x");
        assert_eq!(first, second);
    }

    #[test]
    fn test_has_match() {
        let m = TrieMatcher::new();
        m.add("metrics.*.cpu");
        assert!(m.has_match("metrics.host1.cpu"));
        assert!(!m.has_match("metrics.host1.mem"));
        assert!(!m.has_match("metrics.host1"));
    }

    #[test]
    fn test_double_star_not_terminal_without_subscription() {
        let m = TrieMatcher::new();
        m.add("a.**.b");
        // `**` in the middle is stored literally; it only matches the
        // literal segment "**".
        assert!(match_set(&m, "a.x.b").is_empty());
        assert_eq!(match_set(&m, "a.**.b"), ["a.**.b"]);
    }

    #[test]
    fn test_illegal_patterns_treated_literally() {
        let m = TrieMatcher::new();
        m.add("");
        m.add("..");
        assert_eq!(match_set(&m, ""), [""]);
        assert_eq!(match_set(&m, ".."), [".."]);
        assert!(match_set(&m, "a").is_empty());
    }

    #[test]
    fn test_concurrent_match_and_mutate() {
        use std::sync::Arc as StdArc;
        use std::thread;

        let m = StdArc::new(TrieMatcher::new());
        m.add("base.*");

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let m = StdArc::clone(&m);
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let r = m.match_patterns("base.x");
                        assert!(r.iter().any(|p| p.as_ref() == "base.*"));
                    }
                })
            })
            .collect();

        let writer = {
            let m = StdArc::clone(&m);
            thread::spawn(move || {
                for i in 0..500 {
                    let p = format!("extra.{i}");
                    m.add(&p);
                    m.remove(&p);
                }
            })
        };

        for r in readers {
            r.join().unwrap();
        }
        writer.join().unwrap();
    }
}
