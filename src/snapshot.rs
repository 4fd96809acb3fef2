// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cache::Cache,
    tree::{cursor::Iter, subset::SubsetIter, RootRef},
    Cursor, Policy,
};
use std::sync::Arc;

/// A point-in-time view of one tree.
///
/// Taking a snapshot is O(1): it pins the root pointer and shares all
/// nodes with the live tree copy-on-write. Updates to the live tree build
/// new paths and leave every snapshotted node untouched, so a snapshot
/// stays a consistent view for as long as it is held.
///
/// Snapshots do not persist across restarts; durability goes through the
/// store's `mark`/`sync` boundary.
pub struct Snapshot<P: Policy> {
    cache: Arc<Cache<P>>,
    policy: P,
    root: Option<RootRef<P>>,
    height: u64,
    len: u64,
}

impl<P: Policy> Clone for Snapshot<P> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            policy: self.policy.clone(),
            root: self.root.clone(),
            height: self.height,
            len: self.len,
        }
    }
}

impl<P: Policy> Snapshot<P> {
    pub(crate) fn new(
        cache: Arc<Cache<P>>,
        policy: P,
        root: Option<RootRef<P>>,
        height: u64,
        len: u64,
    ) -> Self {
        Self {
            cache,
            policy,
            root,
            height,
            len,
        }
    }

    pub(crate) fn cache(&self) -> &Arc<Cache<P>> {
        &self.cache
    }

    pub(crate) fn policy(&self) -> &P {
        &self.policy
    }

    pub(crate) fn root(&self) -> &Option<RootRef<P>> {
        &self.root
    }

    pub(crate) fn root_id(&self) -> Option<crate::cache::arena::ProxyId> {
        self.root.as_ref().map(RootRef::id)
    }

    /// Number of entries in this version.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether this version holds no entries.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Tree height of this version.
    pub fn height(&self) -> u64 {
        self.height
    }

    /// Returns the value stored under `key`, pinning one node per level.
    pub fn get(&self, key: &P::Key) -> crate::Result<Option<P::Value>> {
        let Some(root) = self.root_id() else {
            return Ok(None);
        };

        let mut guard = self.cache.node_guard(root)?;

        loop {
            if guard.height() == 0 {
                return Ok(guard
                    .find(&self.policy, key)
                    .map(|i| guard.entry(i).value.clone()));
            }

            let i = guard.child_index(&self.policy, key);
            let child = guard
                .entry(i)
                .child
                .unwrap_or_else(|| unreachable!("interior entry has no child"));

            guard = self.cache.node_guard(child)?;
        }
    }

    /// Whether `key` is present in this version.
    pub fn contains_key(&self, key: &P::Key) -> crate::Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Aggregate of all values, straight off the root node.
    pub fn total(&self) -> crate::Result<Option<P::Value>> {
        let Some(root) = self.root_id() else {
            return Ok(None);
        };

        let guard = self.cache.node_guard(root)?;
        Ok(Some(guard.total().clone()))
    }

    /// Aggregate over the half-open key range `[lo, hi)` in O(log n).
    pub fn range_total(&self, lo: &P::Key, hi: &P::Key) -> crate::Result<Option<P::Value>> {
        let mut cursor = self.lower_bound(lo)?;
        let end = self.lower_bound(hi)?;

        let mut acc = None;
        cursor.accumulate_until_raw(&mut acc, &end, |_| false)?;

        Ok(acc)
    }

    /// Advances `cursor` toward `end`, folding values into `acc` and
    /// stopping right before the inclusion that would first make `pred`
    /// true (see [`crate::Tree::accumulate_until`]).
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
        cursor.accumulate_until_raw(acc, end, pred)
    }

    /// Cursor at the first entry.
    pub fn start(&self) -> crate::Result<Cursor<P>> {
        let mut cursor = Cursor::from_snapshot(self, None);
        cursor.seek_first()?;
        Ok(cursor)
    }

    /// Cursor past the last entry.
    pub fn end(&self) -> crate::Result<Cursor<P>> {
        let mut cursor = Cursor::from_snapshot(self, None);
        cursor.seek_end()?;
        Ok(cursor)
    }

    /// Cursor at `key`, or at the end if absent.
    pub fn find(&self, key: &P::Key) -> crate::Result<Cursor<P>> {
        let mut cursor = Cursor::from_snapshot(self, None);
        cursor.seek_find(key)?;
        Ok(cursor)
    }

    /// Cursor at the first entry whose key is not less than `key`.
    pub fn lower_bound(&self, key: &P::Key) -> crate::Result<Cursor<P>> {
        let mut cursor = Cursor::from_snapshot(self, None);
        cursor.seek_lower_bound(key)?;
        Ok(cursor)
    }

    /// Cursor at the first entry whose key is greater than `key`.
    pub fn upper_bound(&self, key: &P::Key) -> crate::Result<Cursor<P>> {
        let mut cursor = Cursor::from_snapshot(self, None);
        cursor.seek_upper_bound(key)?;
        Ok(cursor)
    }

    /// Iterates all entries of this version in key order.
    pub fn iter(&self) -> Iter<P> {
        Iter::new(self.clone())
    }

    /// Iterates entries whose value satisfies `pred`, skipping subtrees
    /// whose aggregate fails it.
    pub fn subset<F: Fn(&P::Value) -> bool>(&self, pred: F) -> SubsetIter<P, F> {
        SubsetIter::new(self.clone(), pred)
    }

    /// Walks the whole version checking the structural invariants: key
    /// order, node size bounds, leaf depth, the cached aggregates and the
    /// denormalized interior entries. Panics on any violation.
    ///
    /// Test support; this loads every node of the version.
    #[doc(hidden)]
    pub fn verify(&self) -> crate::Result<()>
    where
        P::Key: PartialEq + std::fmt::Debug,
        P::Value: PartialEq + std::fmt::Debug,
    {
        let Some(root) = self.root_id() else {
            assert_eq!(0, self.height, "empty tree must have height 0");
            assert_eq!(0, self.len, "empty tree must have length 0");
            return Ok(());
        };

        assert!(self.height > 0, "non-empty tree must have a height");

        let count = self.verify_node(root, self.height - 1, true)?;
        assert_eq!(self.len, count, "tree length does not match leaf entries");

        Ok(())
    }

    fn verify_node(&self, id: crate::cache::arena::ProxyId, height: u64, is_root: bool) -> crate::Result<u64>
    where
        P::Key: PartialEq + std::fmt::Debug,
        P::Value: PartialEq + std::fmt::Debug,
    {
        let guard = self.cache.node_guard(id)?;

        assert_eq!(height, guard.height(), "node height mismatch");

        let min = if is_root {
            if height == 0 {
                1
            } else {
                2
            }
        } else {
            P::min_size()
        };

        assert!(
            guard.len() >= min && guard.len() <= P::max_size(),
            "node size {} out of range [{min}, {}]",
            guard.len(),
            P::max_size(),
        );

        for pair in guard.entries().windows(2) {
            assert!(
                self.policy.less(&pair[0].key, &pair[1].key),
                "node keys out of order",
            );
        }

        let mut total = guard.entry(0).value.clone();
        for entry in &guard.entries()[1..] {
            self.policy.aggregate(&mut total, &entry.value);
        }
        assert_eq!(
            &total,
            guard.total(),
            "cached aggregate does not match fold of entry values",
        );

        if height == 0 {
            return Ok(guard.len() as u64);
        }

        let mut count = 0;

        for entry in guard.entries() {
            let child = entry.child.expect("interior entry must have a child");

            {
                let child_guard = self.cache.node_guard(child)?;

                assert_eq!(
                    &entry.key,
                    child_guard.first_key(),
                    "entry key does not match child's first key",
                );
                assert_eq!(
                    &entry.value,
                    child_guard.total(),
                    "entry value does not match child's aggregate",
                );
            }

            count += self.verify_node(child, height - 1, false)?;
        }

        Ok(count)
    }
}
