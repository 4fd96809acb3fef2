// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bidirectional cursor over a tree version.
//!
//! A cursor is a stack of `(node, index)` levels from the root down to a
//! leaf: `stack[i + 1]` is the child of `stack[i]` at `stack[i].idx`. The
//! end position is the root level with its index equal to the root size.
//!
//! Every level holds a pin on its node, so the whole path stays resident
//! (and its child proxy ids valid) for the cursor's lifetime.
//!
//! Cursors handed out by [`crate::Tree`] stay bound to the live tree: when
//! the tree's root pointer changes underneath them, they re-seek to their
//! current key on the next access. Cursors from a [`crate::Snapshot`] are
//! fixed to that version.

use crate::{
    cache::{arena::ProxyId, proxy::NodeGuard, Cache},
    tree::{RootRef, Tree},
    Policy, Snapshot,
};
use std::sync::Arc;

pub(crate) struct Level<P: Policy> {
    pub guard: NodeGuard<P>,
    pub idx: usize,
}

/// A bidirectional cursor over the entries of a tree.
pub struct Cursor<P: Policy> {
    cache: Arc<Cache<P>>,
    policy: P,
    root: Option<RootRef<P>>,
    height: u64,
    stack: Vec<Level<P>>,

    /// Live-tree binding; `None` for snapshot cursors
    tree: Option<Tree<P>>,
}

impl<P: Policy> Cursor<P> {
    pub(crate) fn from_snapshot(snapshot: &Snapshot<P>, tree: Option<Tree<P>>) -> Self {
        Self {
            cache: snapshot.cache().clone(),
            policy: snapshot.policy().clone(),
            root: snapshot.root().clone(),
            height: snapshot.height(),
            stack: vec![],
            tree,
        }
    }

    /// Whether the cursor is past the last entry.
    pub fn is_end(&self) -> bool {
        match self.stack.first() {
            None => true,
            Some(level) => level.idx == level.guard.len(),
        }
    }

    /// Current key, after re-seeking if the tree moved underneath us.
    pub fn key(&mut self) -> crate::Result<Option<&P::Key>> {
        self.sync()?;
        Ok(self.current_key())
    }

    /// Current value, after re-seeking if the tree moved underneath us.
    pub fn value(&mut self) -> crate::Result<Option<&P::Value>> {
        self.sync()?;

        if self.is_end() {
            return Ok(None);
        }

        Ok(self.stack.last().map(|level| &level.guard.entry(level.idx).value))
    }

    /// Steps to the next entry in key order; no-op at the end position.
    pub fn advance(&mut self) -> crate::Result<()> {
        self.sync()?;
        self.advance_raw()
    }

    /// Steps to the previous entry; from the end position this lands on
    /// the last entry, and at the first entry it is a no-op.
    pub fn retreat(&mut self) -> crate::Result<()> {
        self.sync()?;
        self.retreat_raw()
    }

    pub(crate) fn current_key(&self) -> Option<&P::Key> {
        if self.is_end() {
            return None;
        }

        self.stack.last().map(|level| &level.guard.entry(level.idx).key)
    }

    pub(crate) fn current_pair(&self) -> Option<(P::Key, P::Value)> {
        if self.is_end() {
            return None;
        }

        self.stack.last().map(|level| {
            let entry = level.guard.entry(level.idx);
            (entry.key.clone(), entry.value.clone())
        })
    }

    pub(crate) fn root_id(&self) -> Option<ProxyId> {
        self.root.as_ref().map(RootRef::id)
    }

    /// Re-seeks by key if the bound tree's root moved since the cursor was
    /// positioned.
    pub(crate) fn sync(&mut self) -> crate::Result<()> {
        let Some(tree) = self.tree.clone() else {
            return Ok(());
        };

        if tree.root_id() == self.root_id() {
            return Ok(());
        }

        let key = self.current_key().cloned();

        let snapshot = tree.snapshot();
        self.root = snapshot.root().clone();
        self.height = snapshot.height();
        self.policy = snapshot.policy().clone();
        self.stack.clear();

        match key {
            Some(key) => self.seek_find(&key),
            None => self.seek_end(),
        }
    }

    fn top(&self) -> &Level<P> {
        match self.stack.last() {
            Some(level) => level,
            None => unreachable!("cursor stack is empty"),
        }
    }

    fn top_mut(&mut self) -> &mut Level<P> {
        match self.stack.last_mut() {
            Some(level) => level,
            None => unreachable!("cursor stack is empty"),
        }
    }

    /// Pushes leftmost children until the stack reaches the leaf level.
    fn descend_first(&mut self) -> crate::Result<()> {
        while (self.stack.len() as u64) < self.height {
            let top = self.top();
            let child = top
                .guard
                .entry(top.idx)
                .child
                .unwrap_or_else(|| unreachable!("interior entry has no child"));

            let guard = self.cache.node_guard(child)?;
            self.stack.push(Level { guard, idx: 0 });
        }

        Ok(())
    }

    /// Pushes rightmost children until the stack reaches the leaf level.
    fn descend_last(&mut self) -> crate::Result<()> {
        while (self.stack.len() as u64) < self.height {
            let top = self.top();
            let child = top
                .guard
                .entry(top.idx)
                .child
                .unwrap_or_else(|| unreachable!("interior entry has no child"));

            let guard = self.cache.node_guard(child)?;
            let idx = guard.len() - 1;
            self.stack.push(Level { guard, idx });
        }

        Ok(())
    }

    pub(crate) fn seek_first(&mut self) -> crate::Result<()> {
        self.stack.clear();

        let Some(root) = self.root_id() else {
            return Ok(());
        };

        let guard = self.cache.node_guard(root)?;
        self.stack.push(Level { guard, idx: 0 });
        self.descend_first()
    }

    pub(crate) fn seek_last(&mut self) -> crate::Result<()> {
        self.stack.clear();

        let Some(root) = self.root_id() else {
            return Ok(());
        };

        let guard = self.cache.node_guard(root)?;
        let idx = guard.len() - 1;
        self.stack.push(Level { guard, idx });
        self.descend_last()
    }

    pub(crate) fn seek_end(&mut self) -> crate::Result<()> {
        self.stack.clear();

        let Some(root) = self.root_id() else {
            return Ok(());
        };

        let guard = self.cache.node_guard(root)?;
        let idx = guard.len();
        self.stack.push(Level { guard, idx });

        Ok(())
    }

    /// Positions at the first entry whose key is not less than `key`.
    pub(crate) fn seek_lower_bound(&mut self, key: &P::Key) -> crate::Result<()> {
        self.stack.clear();

        let Some(root) = self.root_id() else {
            return Ok(());
        };

        let guard = self.cache.node_guard(root)?;

        if !self.policy.less(guard.first_key(), key) {
            drop(guard);
            return self.seek_first();
        }

        // Interior levels: the last child whose first key is less than
        // `key`; the target position is in that subtree or just past it
        let mut guard = guard;
        while (self.stack.len() as u64) + 1 < self.height {
            let idx = guard.lower_bound(&self.policy, key) - 1;
            let child = guard
                .entry(idx)
                .child
                .unwrap_or_else(|| unreachable!("interior entry has no child"));

            self.stack.push(Level { guard, idx });
            guard = self.cache.node_guard(child)?;
        }

        let idx = guard.lower_bound(&self.policy, key) - 1;
        self.stack.push(Level { guard, idx });

        self.advance_raw()
    }

    /// Positions at the first entry whose key is greater than `key`.
    pub(crate) fn seek_upper_bound(&mut self, key: &P::Key) -> crate::Result<()> {
        self.stack.clear();

        let Some(root) = self.root_id() else {
            return Ok(());
        };

        let guard = self.cache.node_guard(root)?;

        if self.policy.less(key, guard.first_key()) {
            drop(guard);
            return self.seek_first();
        }

        let mut guard = guard;
        while (self.stack.len() as u64) + 1 < self.height {
            let idx = guard.upper_bound(&self.policy, key) - 1;
            let child = guard
                .entry(idx)
                .child
                .unwrap_or_else(|| unreachable!("interior entry has no child"));

            self.stack.push(Level { guard, idx });
            guard = self.cache.node_guard(child)?;
        }

        let idx = guard.upper_bound(&self.policy, key) - 1;
        self.stack.push(Level { guard, idx });

        self.advance_raw()
    }

    /// Positions at `key` exactly, or at the end if absent.
    pub(crate) fn seek_find(&mut self, key: &P::Key) -> crate::Result<()> {
        self.seek_lower_bound(key)?;

        let found = match self.current_key() {
            Some(at) => !self.policy.less(at, key) && !self.policy.less(key, at),
            None => false,
        };

        if !found {
            self.seek_end()?;
        }

        Ok(())
    }

    pub(crate) fn advance_raw(&mut self) -> crate::Result<()> {
        if self.is_end() {
            return Ok(());
        }

        self.top_mut().idx += 1;

        while self.top().idx == self.top().guard.len() {
            if self.stack.len() == 1 {
                // Walked off the root: this is the end position
                return Ok(());
            }

            self.stack.pop();
            self.top_mut().idx += 1;
        }

        self.descend_first()
    }

    pub(crate) fn retreat_raw(&mut self) -> crate::Result<()> {
        if self.stack.is_empty() {
            return Ok(());
        }

        if self.is_end() {
            return self.seek_last();
        }

        // Stepping back from the first entry is a no-op
        if self.stack.iter().all(|level| level.idx == 0) {
            return Ok(());
        }

        while self.top().idx == 0 {
            self.stack.pop();
        }

        self.top_mut().idx -= 1;
        self.descend_last()
    }

    /// Advances toward `end`, folding values into `acc`, stopping right
    /// before the inclusion that would first make `pred` true.
    ///
    /// Runs in logarithmic time: at interior levels the cached child
    /// aggregates stand in for whole subtrees, and the walk only descends
    /// into the child whose inclusion would flip the predicate.
    pub(crate) fn accumulate_until_raw<F: Fn(&P::Value) -> bool>(
        &mut self,
        acc: &mut Option<P::Value>,
        end: &Self,
        pred: F,
    ) -> crate::Result<()> {
        if self.is_end() {
            return Ok(());
        }

        debug_assert_eq!(self.root_id(), end.root_id(), "cursors from different versions");

        let non_end = !end.is_end();

        // Climb: exhaust the tail of each level; go up when a level runs
        // out without crossing the predicate
        loop {
            let depth = self.stack.len() - 1;

            let clip = end_clip(&self.stack, end, non_end, depth);

            let stopped = {
                let level = match self.stack.last_mut() {
                    Some(level) => level,
                    None => unreachable!("cursor stack is empty"),
                };
                let clip = clip.unwrap_or(level.guard.len());
                walk_until(&self.policy, acc, level, clip, &pred);
                level.idx != level.guard.len()
            };

            if stopped {
                break;
            }

            if self.stack.len() == 1 {
                // Walked off the whole tree; the stack already encodes end
                return Ok(());
            }

            self.stack.pop();
            // The subtree we climbed out of is fully accounted for
            self.top_mut().idx += 1;
        }

        // Descend: enter the child whose inclusion would cross, and keep
        // walking inside it
        while (self.stack.len() as u64) < self.height {
            let top = self.top();
            let child = top
                .guard
                .entry(top.idx)
                .child
                .unwrap_or_else(|| unreachable!("interior entry has no child"));

            let guard = self.cache.node_guard(child)?;
            self.stack.push(Level { guard, idx: 0 });

            let depth = self.stack.len() - 1;
            let clip = end_clip(&self.stack, end, non_end, depth);

            let level = match self.stack.last_mut() {
                Some(level) => level,
                None => unreachable!("cursor stack is empty"),
            };
            let clip = clip.unwrap_or(level.guard.len());
            walk_until(&self.policy, acc, level, clip, &pred);
        }

        Ok(())
    }
}

/// If the walking cursor sits in the same node as `end` at this depth, the
/// walk must not run past `end`'s index there.
fn end_clip<P: Policy>(
    stack: &[Level<P>],
    end: &Cursor<P>,
    non_end: bool,
    depth: usize,
) -> Option<usize> {
    if !non_end {
        return None;
    }

    let own = stack.get(depth)?;
    let theirs = end.stack.get(depth)?;

    (own.guard.id() == theirs.guard.id()).then_some(theirs.idx)
}

/// Folds values of one level into `acc` until `end_idx` is reached or the
/// next inclusion would make `pred` true.
fn walk_until<P: Policy, F: Fn(&P::Value) -> bool>(
    policy: &P,
    acc: &mut Option<P::Value>,
    level: &mut Level<P>,
    end_idx: usize,
    pred: &F,
) {
    while level.idx < end_idx {
        let value = &level.guard.entry(level.idx).value;

        let candidate = match acc {
            None => value.clone(),
            Some(acc) => {
                let mut candidate = acc.clone();
                policy.aggregate(&mut candidate, value);
                candidate
            }
        };

        if pred(&candidate) {
            break;
        }

        *acc = Some(candidate);
        level.idx += 1;
    }
}

/// Iterator over the entries of one tree version, in key order.
pub struct Iter<P: Policy> {
    snapshot: Snapshot<P>,
    cursor: Option<Cursor<P>>,
    done: bool,
}

impl<P: Policy> Iter<P> {
    pub(crate) fn new(snapshot: Snapshot<P>) -> Self {
        Self {
            snapshot,
            cursor: None,
            done: false,
        }
    }
}

impl<P: Policy> Iterator for Iter<P> {
    type Item = crate::Result<(P::Key, P::Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.cursor.is_none() {
            let mut cursor = Cursor::from_snapshot(&self.snapshot, None);

            if let Err(e) = cursor.seek_first() {
                self.done = true;
                return Some(Err(e));
            }

            self.cursor = Some(cursor);
        }

        let cursor = self.cursor.as_mut()?;

        let Some(pair) = cursor.current_pair() else {
            self.done = true;
            return None;
        };

        if let Err(e) = cursor.advance_raw() {
            self.done = true;
            return Some(Err(e));
        }

        Some(Ok(pair))
    }
}
