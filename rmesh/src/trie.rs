//! Lock-free subscription trie.
//!
//! A Ctrie over SSID words: every I-node holds an atomic pointer to an
//! immutable main node, either a C-node (branches keyed by word) or a
//! T-node (tombstone of an emptied interior node). Updates copy the C-node,
//! change one branch and install the copy with a compare-and-swap; a failed
//! swap restarts the operation from the root. Retired nodes are reclaimed
//! by the epoch collector once no reader holds a guard on them.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use scc::ebr::{AtomicShared, Guard, Ptr, Shared, Tag};

use crate::message::{Ssid, WILDCARD};

type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;

/// Handle returned by [`Trie::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription<S> {
    pub ssid: Ssid,
    pub subscriber: S,
}

struct INode<S: 'static> {
    main: AtomicShared<MainNode<S>>,
}

enum MainNode<S: 'static> {
    C(CNode<S>),
    T,
}

struct CNode<S: 'static> {
    branches: HashMap<u32, Arc<Branch<S>>>,
}

struct Branch<S: 'static> {
    subs: HashSet<S>,
    inode: Option<Arc<INode<S>>>,
}

impl<S: 'static> Default for CNode<S> {
    fn default() -> Self {
        CNode { branches: HashMap::default() }
    }
}

impl<S: 'static> Clone for CNode<S> {
    fn clone(&self) -> Self {
        CNode { branches: self.branches.clone() }
    }
}

impl<S> CNode<S>
where
    S: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// A copy with `word` set to `branch`, or without `word` when the branch is empty.
    fn with_branch(&self, word: u32, branch: Branch<S>) -> CNode<S> {
        let mut cn = self.clone();
        if branch.is_empty() {
            cn.branches.remove(&word);
        } else {
            cn.branches.insert(word, Arc::new(branch));
        }
        cn
    }

    /// A copy without the I-nodes that were tombed, `None` when there are none.
    fn compressed(&self, guard: &Guard) -> Option<CNode<S>> {
        let mut cn: Option<CNode<S>> = None;
        for (word, branch) in self.branches.iter() {
            let tombed = branch.inode.as_ref().is_some_and(|inode| inode.is_tombed(guard));
            if tombed {
                let next = cn.as_ref().unwrap_or(self);
                cn = Some(next.with_branch(*word, Branch { subs: branch.subs.clone(), inode: None }));
            }
        }
        cn
    }
}

impl<S> Branch<S>
where
    S: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn chain(words: &[u32], sub: S) -> Branch<S> {
        if words.is_empty() {
            let mut subs = HashSet::default();
            subs.insert(sub);
            Branch { subs, inode: None }
        } else {
            Branch { subs: HashSet::default(), inode: Some(Arc::new(INode::chain(words, sub))) }
        }
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.subs.is_empty() && self.inode.is_none()
    }
}

impl<S> INode<S>
where
    S: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn new(main: MainNode<S>) -> Self {
        INode { main: AtomicShared::new(main) }
    }

    /// A fresh path of C-nodes for `words` ending in a set holding `sub`.
    fn chain(words: &[u32], sub: S) -> INode<S> {
        let mut cn = CNode::default();
        if let Some((word, rest)) = words.split_first() {
            cn.branches.insert(*word, Arc::new(Branch::chain(rest, sub)));
        }
        INode::new(MainNode::C(cn))
    }

    #[inline]
    fn is_tombed(&self, guard: &Guard) -> bool {
        matches!(self.main.load(Ordering::Acquire, guard).as_ref(), Some(MainNode::T))
    }
}

pub struct Trie<S: 'static> {
    root: INode<S>,
}

impl<S> Default for Trie<S>
where
    S: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Trie<S>
where
    S: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Trie { root: INode::new(MainNode::C(CNode::default())) }
    }

    /// Adds `subscriber` under `ssid`, subscribing twice is a no-op.
    pub fn subscribe(&self, ssid: &Ssid, subscriber: S) -> Subscription<S> {
        if !ssid.is_empty() {
            loop {
                let guard = Guard::new();
                if self.isubscribe(&self.root, None, ssid, &subscriber, &guard).is_some() {
                    break;
                }
            }
        }
        Subscription { ssid: ssid.clone(), subscriber }
    }

    /// Removes `subscriber` from `ssid`, returns false when it was not there.
    pub fn unsubscribe(&self, ssid: &Ssid, subscriber: &S) -> bool {
        if ssid.is_empty() {
            return false;
        }
        loop {
            let guard = Guard::new();
            if let Some(removed) = self.iunsubscribe(&self.root, None, ssid, subscriber, &guard) {
                return removed;
            }
        }
    }

    /// Every subscriber whose pattern matches a prefix of `query`, a
    /// wildcard word in a pattern matching any word.
    pub fn lookup(&self, query: &[u32]) -> HashSet<S> {
        loop {
            let guard = Guard::new();
            let mut out = HashSet::default();
            if self.ilookup(&self.root, None, query, &mut out, &guard) {
                return out;
            }
        }
    }

    /// Number of (pattern, subscriber) pairs.
    pub fn count(&self) -> usize {
        let guard = Guard::new();
        Self::icount(&self.root, &guard)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        let guard = Guard::new();
        match self.root.main.load(Ordering::Acquire, &guard).as_ref() {
            Some(MainNode::C(cn)) => cn.branches.is_empty(),
            _ => true,
        }
    }

    #[inline]
    fn is_root(&self, i: &INode<S>) -> bool {
        std::ptr::eq(i, &self.root)
    }

    #[inline]
    fn cas<'g>(&self, i: &INode<S>, current: Ptr<'g, MainNode<S>>, main: MainNode<S>, guard: &'g Guard) -> bool {
        i.main
            .compare_exchange(current, (Some(Shared::new(main)), Tag::None), Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
    }

    /// An empty C-node below the root turns into a tombstone.
    #[inline]
    fn contracted(&self, i: &INode<S>, cn: CNode<S>) -> MainNode<S> {
        if cn.branches.is_empty() && !self.is_root(i) {
            MainNode::T
        } else {
            MainNode::C(cn)
        }
    }

    fn clean(&self, i: &INode<S>, guard: &Guard) {
        let ptr = i.main.load(Ordering::Acquire, guard);
        if let Some(MainNode::C(cn)) = ptr.as_ref() {
            if let Some(cn) = cn.compressed(guard) {
                let main = self.contracted(i, cn);
                let _ = self.cas(i, ptr, main, guard);
            }
        }
    }

    /// Drops the branch pointer to `child` once `child` is tombed.
    fn clean_child(&self, i: &INode<S>, word: u32, child: &Arc<INode<S>>, guard: &Guard) {
        loop {
            let ptr = i.main.load(Ordering::Acquire, guard);
            let Some(MainNode::C(cn)) = ptr.as_ref() else {
                return;
            };
            let Some(branch) = cn.branches.get(&word) else {
                return;
            };
            let points_to_child = branch.inode.as_ref().is_some_and(|inode| Arc::ptr_eq(inode, child));
            if !points_to_child || !child.is_tombed(guard) {
                return;
            }
            let cn = cn.with_branch(word, Branch { subs: branch.subs.clone(), inode: None });
            let main = self.contracted(i, cn);
            if self.cas(i, ptr, main, guard) {
                return;
            }
        }
    }

    /// `None` asks the caller to restart from the root.
    fn isubscribe(
        &self,
        i: &INode<S>,
        parent: Option<&INode<S>>,
        words: &[u32],
        sub: &S,
        guard: &Guard,
    ) -> Option<bool> {
        let ptr = i.main.load(Ordering::Acquire, guard);
        let cn = match ptr.as_ref() {
            Some(MainNode::C(cn)) => cn,
            _ => {
                if let Some(p) = parent {
                    self.clean(p, guard);
                }
                return None;
            }
        };
        let Some((word, rest)) = words.split_first() else {
            return Some(false);
        };

        let Some(branch) = cn.branches.get(word) else {
            let cn = cn.with_branch(*word, Branch::chain(rest, sub.clone()));
            return self.cas(i, ptr, MainNode::C(cn), guard).then_some(true);
        };

        if rest.is_empty() {
            if branch.subs.contains(sub) {
                return Some(false);
            }
            let mut subs = branch.subs.clone();
            subs.insert(sub.clone());
            let cn = cn.with_branch(*word, Branch { subs, inode: branch.inode.clone() });
            self.cas(i, ptr, MainNode::C(cn), guard).then_some(true)
        } else if let Some(child) = branch.inode.as_ref() {
            self.isubscribe(child, Some(i), rest, sub, guard)
        } else {
            let inode = Arc::new(INode::chain(rest, sub.clone()));
            let cn = cn.with_branch(*word, Branch { subs: branch.subs.clone(), inode: Some(inode) });
            self.cas(i, ptr, MainNode::C(cn), guard).then_some(true)
        }
    }

    fn iunsubscribe(
        &self,
        i: &INode<S>,
        parent: Option<&INode<S>>,
        words: &[u32],
        sub: &S,
        guard: &Guard,
    ) -> Option<bool> {
        let ptr = i.main.load(Ordering::Acquire, guard);
        let cn = match ptr.as_ref() {
            Some(MainNode::C(cn)) => cn,
            _ => {
                if let Some(p) = parent {
                    self.clean(p, guard);
                }
                return None;
            }
        };
        let Some((word, rest)) = words.split_first() else {
            return Some(false);
        };
        let Some(branch) = cn.branches.get(word) else {
            return Some(false);
        };

        if rest.is_empty() {
            if !branch.subs.contains(sub) {
                return Some(false);
            }
            let mut subs = branch.subs.clone();
            subs.remove(sub);
            let cn = cn.with_branch(*word, Branch { subs, inode: branch.inode.clone() });
            let main = self.contracted(i, cn);
            self.cas(i, ptr, main, guard).then_some(true)
        } else if let Some(child) = branch.inode.as_ref() {
            let removed = self.iunsubscribe(child, Some(i), rest, sub, guard)?;
            if removed {
                self.clean_child(i, *word, child, guard);
            }
            Some(removed)
        } else {
            Some(false)
        }
    }

    /// false asks the caller to restart from the root.
    fn ilookup(
        &self,
        i: &INode<S>,
        parent: Option<&INode<S>>,
        words: &[u32],
        out: &mut HashSet<S>,
        guard: &Guard,
    ) -> bool {
        let ptr = i.main.load(Ordering::Acquire, guard);
        let cn = match ptr.as_ref() {
            Some(MainNode::C(cn)) => cn,
            _ => {
                if let Some(p) = parent {
                    self.clean(p, guard);
                }
                return false;
            }
        };
        let Some((word, rest)) = words.split_first() else {
            return true;
        };

        let keys = std::iter::once(*word).chain((*word != WILDCARD).then_some(WILDCARD));
        for key in keys {
            let Some(branch) = cn.branches.get(&key) else {
                continue;
            };
            out.extend(branch.subs.iter().cloned());
            if rest.is_empty() {
                continue;
            }
            if let Some(child) = branch.inode.as_ref() {
                if !self.ilookup(child, Some(i), rest, out, guard) {
                    return false;
                }
            }
        }
        true
    }

    fn icount(i: &INode<S>, guard: &Guard) -> usize {
        match i.main.load(Ordering::Acquire, guard).as_ref() {
            Some(MainNode::C(cn)) => cn
                .branches
                .values()
                .map(|b| b.subs.len() + b.inode.as_ref().map(|child| Self::icount(child, guard)).unwrap_or(0))
                .sum(),
            _ => 0,
        }
    }
}

impl<S> fmt::Debug for Trie<S>
where
    S: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Trie {{ count: {} }}", self.count())
    }
}
