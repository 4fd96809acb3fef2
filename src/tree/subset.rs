// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Forward iterator over entries whose value satisfies a predicate,
//! pruning whole subtrees by their cached aggregate.
//!
//! At an interior level the entry value is the child subtree's aggregate;
//! if the predicate rejects it, the subtree is skipped without descending.
//! For the pruning to be exact the predicate must be monotone with respect
//! to the aggregation (a subtree whose aggregate fails must contain no
//! passing value), as with bitmask or maximum style aggregates.

use crate::{tree::cursor::Level, Policy, Snapshot};

/// Iterator over the matching entries of one tree version, in key order.
pub struct SubsetIter<P: Policy, F> {
    snapshot: Snapshot<P>,
    stack: Vec<Level<P>>,
    pred: F,
    started: bool,
    done: bool,
}

impl<P: Policy, F: Fn(&P::Value) -> bool> SubsetIter<P, F> {
    pub(crate) fn new(snapshot: Snapshot<P>, pred: F) -> Self {
        Self {
            snapshot,
            stack: vec![],
            pred,
            started: false,
            done: false,
        }
    }

    /// Positions the stack at the next entry (leaf level) accepted by the
    /// predicate, descending only into accepted subtrees.
    fn next_valid(&mut self) -> crate::Result<()> {
        while let Some(top) = self.stack.last() {
            if (self.pred)(&top.guard.entry(top.idx).value) {
                if self.stack.len() as u64 == self.snapshot.height() {
                    return Ok(());
                }

                let child = top
                    .guard
                    .entry(top.idx)
                    .child
                    .unwrap_or_else(|| unreachable!("interior entry has no child"));

                let guard = self.snapshot.cache().node_guard(child)?;
                self.stack.push(Level { guard, idx: 0 });
            } else {
                self.forward_up();
            }
        }

        Ok(())
    }

    /// Steps to the next entry at the current level, climbing out of
    /// exhausted nodes.
    fn forward_up(&mut self) {
        while let Some(top) = self.stack.last_mut() {
            top.idx += 1;

            if top.idx < top.guard.len() {
                return;
            }

            self.stack.pop();
        }
    }
}

impl<P: Policy, F: Fn(&P::Value) -> bool> Iterator for SubsetIter<P, F> {
    type Item = crate::Result<(P::Key, P::Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if !self.started {
            self.started = true;

            if self.snapshot.height() > 0 {
                let root = self.snapshot.root_id()?;

                let guard = match self.snapshot.cache().node_guard(root) {
                    Ok(guard) => guard,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                };

                self.stack.push(Level { guard, idx: 0 });

                if let Err(e) = self.next_valid() {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }

        let Some(top) = self.stack.last() else {
            self.done = true;
            return None;
        };

        let entry = top.guard.entry(top.idx);
        let pair = (entry.key.clone(), entry.value.clone());

        self.forward_up();

        if !self.stack.is_empty() {
            if let Err(e) = self.next_valid() {
                self.done = true;
                return Some(Err(e));
            }
        }

        Some(Ok(pair))
    }
}
