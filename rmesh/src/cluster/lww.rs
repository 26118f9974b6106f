//! Last-write-wins element set.

use std::cmp::max;
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use crate::utils::timestamp_nanos;

type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

static CLOCK: AtomicI64 = AtomicI64::new(0);

/// Wall-clock nanoseconds, strictly increasing within the process.
pub fn now() -> i64 {
    let mut prev = CLOCK.load(Ordering::SeqCst);
    loop {
        let next = max(prev + 1, timestamp_nanos());
        match CLOCK.compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwTime {
    pub add: i64,
    pub del: i64,
}

impl LwwTime {
    #[inline]
    pub fn is_added(&self) -> bool {
        self.add > self.del
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.del > self.add
    }
}

/// Each element carries the time it was last added and last removed, it
/// is a member while the add is newer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(serialize = "K: Serialize", deserialize = "K: Deserialize<'de> + Eq + Hash"))]
pub struct LwwSet<K: Eq + Hash> {
    set: HashMap<K, LwwTime>,
}

impl<K: Eq + Hash> Default for LwwSet<K> {
    fn default() -> Self {
        Self { set: HashMap::default() }
    }
}

impl<K> LwwSet<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// A set of one element, used to broadcast single changes.
    pub fn single(k: K, t: LwwTime) -> Self {
        let mut s = Self::new();
        s.set.insert(k, t);
        s
    }

    #[inline]
    pub fn add(&mut self, k: K) -> LwwTime {
        self.add_at(k, now())
    }

    #[inline]
    pub fn remove(&mut self, k: K) -> LwwTime {
        self.remove_at(k, now())
    }

    pub fn add_at(&mut self, k: K, t: i64) -> LwwTime {
        let v = self.set.entry(k).or_default();
        v.add = max(v.add, t);
        *v
    }

    pub fn remove_at(&mut self, k: K, t: i64) -> LwwTime {
        let v = self.set.entry(k).or_default();
        v.del = max(v.del, t);
        *v
    }

    #[inline]
    pub fn get(&self, k: &K) -> Option<LwwTime> {
        self.set.get(k).copied()
    }

    #[inline]
    pub fn contains(&self, k: &K) -> bool {
        self.set.get(k).is_some_and(LwwTime::is_added)
    }

    /// Merges `other` into this set, element-wise maximum of both times,
    /// and leaves in `other` only what changed here.
    pub fn merge(&mut self, other: &mut LwwSet<K>) {
        let mut delta = HashMap::default();
        for (k, incoming) in other.set.drain() {
            let local = self.set.get(&k).copied().unwrap_or_default();
            let merged = LwwTime { add: max(local.add, incoming.add), del: max(local.del, incoming.del) };
            if merged != local {
                self.set.insert(k.clone(), merged);
                delta.insert(k, merged);
            }
        }
        other.set = delta;
    }

    /// Forgets elements removed for good before `cutoff`.
    pub fn gc(&mut self, cutoff: i64) -> usize {
        let before = self.set.len();
        self.set.retain(|_, t| !(t.add < cutoff && t.del < cutoff && t.is_removed()));
        before - self.set.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.set.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&K, &LwwTime)> {
        self.set.iter()
    }
}
