// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The ordered aggregate map.
//!
//! A [`Tree`] is a `(root, height, length)` triple over copy-on-write
//! nodes: an update never mutates a previously visible node, it rebuilds
//! the path from the touched leaf up to a new root and swaps the root
//! pointer. Earlier snapshots and cursors keep seeing the version they
//! were opened against.

pub mod cursor;
pub(crate) mod node;
pub mod subset;

use crate::{
    cache::{arena::ProxyId, Cache},
    tree::node::{Entry, Node, Outcome, UpdateResult, Updater},
    Cursor, Policy, Snapshot,
};
use std::sync::{Arc, Mutex, MutexGuard};

/// Owning reference to a root (or otherwise retained) proxy.
pub(crate) struct RootRef<P: Policy> {
    cache: Arc<Cache<P>>,
    id: ProxyId,
}

impl<P: Policy> RootRef<P> {
    /// Takes ownership of an already-counted reference.
    pub fn adopt(cache: Arc<Cache<P>>, id: ProxyId) -> Self {
        Self { cache, id }
    }

    pub fn id(&self) -> ProxyId {
        self.id
    }
}

impl<P: Policy> Clone for RootRef<P> {
    fn clone(&self) -> Self {
        self.cache.acquire(self.id);
        Self {
            cache: self.cache.clone(),
            id: self.id,
        }
    }
}

impl<P: Policy> Drop for RootRef<P> {
    fn drop(&mut self) {
        self.cache.release(self.id);
    }
}

pub(crate) struct TreeState<P: Policy> {
    pub policy: P,
    pub root: Option<RootRef<P>>,
    pub height: u64,
    pub len: u64,
}

struct TreeShared<P: Policy> {
    cache: Arc<Cache<P>>,
    state: Mutex<TreeState<P>>,
}

/// A named, ordered key→value map whose interior nodes cache an aggregate
/// of all descendant values.
///
/// `Tree` is a shared handle: clones refer to the same named tree of the
/// store. For an independent point-in-time copy, take a [`Tree::snapshot`];
/// it is O(1) and shares structure copy-on-write.
pub struct Tree<P: Policy>(Arc<TreeShared<P>>);

impl<P: Policy> Clone for Tree<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

struct PutOp<V>(V);

impl<V> Updater<V> for PutOp<V> {
    fn apply(self, _: Option<&V>) -> Outcome<V> {
        Outcome::Put(self.0)
    }
}

struct InsertOp<V>(V);

impl<V> Updater<V> for InsertOp<V> {
    fn apply(self, current: Option<&V>) -> Outcome<V> {
        if current.is_some() {
            Outcome::Keep
        } else {
            Outcome::Put(self.0)
        }
    }
}

struct EraseOp;

impl<V> Updater<V> for EraseOp {
    fn apply(self, current: Option<&V>) -> Outcome<V> {
        if current.is_some() {
            Outcome::Remove
        } else {
            Outcome::Keep
        }
    }
}

struct WithOp<F>(F);

impl<V, F: FnOnce(Option<&V>) -> Option<V>> Updater<V> for WithOp<F> {
    fn apply(self, current: Option<&V>) -> Outcome<V> {
        let existed = current.is_some();

        match ((self.0)(current), existed) {
            (Some(value), _) => Outcome::Put(value),
            (None, true) => Outcome::Remove,
            (None, false) => Outcome::Keep,
        }
    }
}

impl<P: Policy> Tree<P> {
    pub(crate) fn new(cache: Arc<Cache<P>>, policy: P) -> Self {
        Self::with_root(cache, policy, None, 0, 0)
    }

    pub(crate) fn with_root(
        cache: Arc<Cache<P>>,
        policy: P,
        root: Option<RootRef<P>>,
        height: u64,
        len: u64,
    ) -> Self {
        Self(Arc::new(TreeShared {
            cache,
            state: Mutex::new(TreeState {
                policy,
                root,
                height,
                len,
            }),
        }))
    }

    fn lock_state(&self) -> MutexGuard<'_, TreeState<P>> {
        self.0.state.lock().expect("tree lock is poisoned")
    }

    /// Number of entries.
    pub fn len(&self) -> u64 {
        self.lock_state().len
    }

    /// Whether the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.lock_state().root.is_none()
    }

    /// Tree height (0 for an empty tree, 1 for a single leaf).
    pub fn height(&self) -> u64 {
        self.lock_state().height
    }

    /// Takes an O(1) point-in-time copy sharing structure with the live
    /// tree. Later updates to either side do not affect the other.
    pub fn snapshot(&self) -> Snapshot<P> {
        let state = self.lock_state();
        Snapshot::new(
            self.0.cache.clone(),
            state.policy.clone(),
            state.root.clone(),
            state.height,
            state.len,
        )
    }

    pub(crate) fn root_id(&self) -> Option<ProxyId> {
        self.lock_state().root.as_ref().map(RootRef::id)
    }

    pub(crate) fn set_policy(&self, policy: P) {
        self.lock_state().policy = policy;
    }

    pub(crate) fn restore(&self, snapshot: &Snapshot<P>) {
        let mut state = self.lock_state();
        state.policy = snapshot.policy().clone();
        state.root = snapshot.root().clone();
        state.height = snapshot.height();
        state.len = snapshot.len();
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &P::Key) -> crate::Result<Option<P::Value>> {
        self.snapshot().get(key)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &P::Key) -> crate::Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Idempotent upsert: stores `value` under `key`, replacing any
    /// previous value.
    pub fn set(&self, key: &P::Key, value: P::Value) -> crate::Result<()> {
        self.apply(key, PutOp(value))?;
        Ok(())
    }

    /// Inserts only if `key` is absent; returns whether it inserted.
    pub fn insert_if_absent(&self, key: &P::Key, value: P::Value) -> crate::Result<bool> {
        self.apply(key, InsertOp(value))
    }

    /// Removes `key`; returns whether it was present.
    pub fn erase(&self, key: &P::Key) -> crate::Result<bool> {
        self.apply(key, EraseOp)
    }

    /// Generalized update: `f` sees the current value (if any) and returns
    /// the new one. Returning `None` erases a present key and is a no-op
    /// for an absent one. Returns whether anything changed.
    ///
    /// Insert, erase and modify all reduce to this one primitive, sharing
    /// a single rebalancing implementation.
    pub fn update_with<F>(&self, key: &P::Key, f: F) -> crate::Result<bool>
    where
        F: FnOnce(Option<&P::Value>) -> Option<P::Value>,
    {
        self.apply(key, WithOp(f))
    }

    /// Aggregate of all values, in O(1) from the root.
    pub fn total(&self) -> crate::Result<Option<P::Value>> {
        self.snapshot().total()
    }

    /// Aggregate over the half-open key range `[lo, hi)` in O(log n).
    pub fn range_total(&self, lo: &P::Key, hi: &P::Key) -> crate::Result<Option<P::Value>> {
        self.snapshot().range_total(lo, hi)
    }

    /// Iterates all entries of the current version in key order.
    pub fn iter(&self) -> crate::tree::cursor::Iter<P> {
        self.snapshot().iter()
    }

    /// Iterates entries whose value satisfies `pred`, skipping subtrees
    /// whose aggregate fails it (see [`crate::SubsetIter`]).
    pub fn subset<F: Fn(&P::Value) -> bool>(&self, pred: F) -> crate::SubsetIter<P, F> {
        self.snapshot().subset(pred)
    }

    /// Cursor at the first entry.
    pub fn start(&self) -> crate::Result<Cursor<P>> {
        let mut cursor = Cursor::from_snapshot(&self.snapshot(), Some(self.clone()));
        cursor.seek_first()?;
        Ok(cursor)
    }

    /// Cursor past the last entry.
    pub fn end(&self) -> crate::Result<Cursor<P>> {
        let mut cursor = Cursor::from_snapshot(&self.snapshot(), Some(self.clone()));
        cursor.seek_end()?;
        Ok(cursor)
    }

    /// Cursor at `key`, or at the end if absent.
    pub fn find(&self, key: &P::Key) -> crate::Result<Cursor<P>> {
        let mut cursor = Cursor::from_snapshot(&self.snapshot(), Some(self.clone()));
        cursor.seek_find(key)?;
        Ok(cursor)
    }

    /// Cursor at the first entry whose key is not less than `key`.
    pub fn lower_bound(&self, key: &P::Key) -> crate::Result<Cursor<P>> {
        let mut cursor = Cursor::from_snapshot(&self.snapshot(), Some(self.clone()));
        cursor.seek_lower_bound(key)?;
        Ok(cursor)
    }

    /// Cursor at the first entry whose key is greater than `key`.
    pub fn upper_bound(&self, key: &P::Key) -> crate::Result<Cursor<P>> {
        let mut cursor = Cursor::from_snapshot(&self.snapshot(), Some(self.clone()));
        cursor.seek_upper_bound(key)?;
        Ok(cursor)
    }

    /// Advances `cursor` toward `end`, folding values into `acc` and
    /// stopping right before the inclusion that would first make `pred`
    /// true. Runs in O(log n) using the cached subtree aggregates.
    ///
    /// `end` must come from the same tree version the cursor currently
    /// sees.
    pub fn accumulate_until<F>(
        &self,
        cursor: &mut Cursor<P>,
        acc: &mut Option<P::Value>,
        end: &Cursor<P>,
        pred: F,
    ) -> crate::Result<()>
    where
        F: Fn(&P::Value) -> bool,
    {
        cursor.sync()?;
        cursor.accumulate_until_raw(acc, end, pred)
    }

    /// Drops every entry. In-memory only; durability still goes through
    /// the store's commit boundary.
    pub fn clear(&self) {
        let mut state = self.lock_state();
        state.root = None;
        state.height = 0;
        state.len = 0;
    }

    /// Swaps the contents of two trees in O(1).
    pub fn swap(&self, other: &Self) {
        if Arc::ptr_eq(&self.0, &other.0) {
            return;
        }

        // Lock in address order
        let (first, second) = if Arc::as_ptr(&self.0) < Arc::as_ptr(&other.0) {
            (self, other)
        } else {
            (other, self)
        };

        let mut a = first.lock_state();
        let mut b = second.lock_state();
        std::mem::swap(&mut *a, &mut *b);
    }

    /// Runs one update against the root, handling collapse and growth.
    fn apply<U: Updater<P::Value>>(&self, key: &P::Key, updater: U) -> crate::Result<bool> {
        let cache = &self.0.cache;
        let mut state = self.lock_state();

        let root_id = state.root.as_ref().map(RootRef::id);

        let changed = match root_id {
            None => match updater.apply(None) {
                Outcome::Put(value) => {
                    let node = Node::new_leaf(key.clone(), value);
                    let id = cache.new_node(node, state.policy.clone())?;

                    state.root = Some(RootRef::adopt(cache.clone(), id));
                    state.height = 1;
                    state.len = 1;
                    true
                }
                _ => false,
            },

            Some(root_id) => {
                let mut w_root = cache.copy_node(root_id)?;

                match w_root.update(cache, &state.policy, key, None, updater)? {
                    UpdateResult::Nop => {
                        cache.discard_node(&w_root);
                        false
                    }

                    UpdateResult::Modify => {
                        self.swap_root(cache, &mut state, w_root)?;
                        true
                    }

                    UpdateResult::Insert => {
                        self.swap_root(cache, &mut state, w_root)?;
                        state.len += 1;
                        true
                    }

                    UpdateResult::Erase => {
                        self.swap_root(cache, &mut state, w_root)?;
                        state.len -= 1;
                        true
                    }

                    UpdateResult::Split(sibling) => {
                        // The root split; grow the tree by one level
                        let sibling = *sibling;

                        let left_entry = Entry {
                            key: w_root.first_key().clone(),
                            value: w_root.total().clone(),
                            child: Some(cache.new_node(w_root, state.policy.clone())?),
                        };
                        let right_entry = Entry {
                            key: sibling.first_key().clone(),
                            value: sibling.total().clone(),
                            child: Some(cache.new_node(sibling, state.policy.clone())?),
                        };

                        let root = Node::from_entries(
                            state.height,
                            vec![left_entry, right_entry],
                            &state.policy,
                        );
                        let id = cache.new_node(root, state.policy.clone())?;

                        state.root = Some(RootRef::adopt(cache.clone(), id));
                        state.height += 1;
                        state.len += 1;
                        true
                    }

                    UpdateResult::Singular => {
                        // The root is down to one child; drop a level
                        let child = w_root
                            .take_only_child()
                            .unwrap_or_else(|| unreachable!("singular root has no child"));
                        cache.discard_node(&w_root);

                        state.root = Some(RootRef::adopt(cache.clone(), child));
                        state.height -= 1;
                        state.len -= 1;
                        true
                    }

                    UpdateResult::Empty => {
                        cache.discard_node(&w_root);
                        state.root = None;
                        state.height = 0;
                        state.len = 0;
                        true
                    }

                    UpdateResult::Steal { .. } | UpdateResult::Merge { .. } => {
                        unreachable!("root has no peer")
                    }
                }
            }
        };

        drop(state);

        if changed {
            // Rolling compaction: forward one generation of old data so
            // slab files can be reclaimed at the next sync
            self.0.cache.clean_one()?;
        }

        Ok(changed)
    }

    fn swap_root(
        &self,
        cache: &Arc<Cache<P>>,
        state: &mut TreeState<P>,
        w_root: Node<P>,
    ) -> crate::Result<()> {
        let id = cache.new_node(w_root, state.policy.clone())?;
        state.root = Some(RootRef::adopt(cache.clone(), id));
        Ok(())
    }
}
