// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! B-tree node and its rebalancing protocol.
//!
//! A node is a sorted array of `(key, value, child)` entries plus a cached
//! aggregate of all values. For an interior node, `entry.key` is the first
//! key of the child subtree and `entry.value` its aggregate; both are kept
//! in sync by the update path below.
//!
//! All mutations funnel through [`Node::update`], which drives insert,
//! erase and modify through a single rebalancing implementation. Nodes are
//! logically immutable once published; updates run on private copies made
//! with [`crate::cache::Cache::copy_node`].

use crate::{
    cache::{arena::ProxyId, Cache},
    Policy,
};

/// What the updater decided to do with the addressed slot.
pub(crate) enum Outcome<V> {
    /// Leave the slot as it is
    Keep,

    /// Write this value (insert if the key was absent)
    Put(V),

    /// Erase the key if present
    Remove,
}

/// A single mutation, applied to the value currently stored under a key
/// (or `None` if the key is absent).
pub(crate) trait Updater<V> {
    fn apply(self, current: Option<&V>) -> Outcome<V>;
}

/// Result of an update below some node, telling the parent how to react.
pub(crate) enum UpdateResult<P: Policy> {
    /// No change at all
    Nop,

    /// An entry changed in place
    Modify,

    /// An entry was inserted, no split needed
    Insert,

    /// An entry was erased, peer untouched
    Erase,

    /// The node overflowed; the new right sibling is attached
    Split(Box<Node<P>>),

    /// Erased, and one entry was moved over from the peer
    Steal {
        peer: ProxyId,
        peer_key: <P as Policy>::Key,
        peer_total: <P as Policy>::Value,
    },

    /// Erased, and the node was folded into the peer
    Merge {
        peer: ProxyId,
        peer_key: <P as Policy>::Key,
        peer_total: <P as Policy>::Value,
    },

    /// Erased at the root, which is down to a single child
    Singular,

    /// Erased the last entry of the tree
    Empty,
}

#[derive(Clone)]
pub(crate) struct Entry<P: Policy> {
    pub key: P::Key,
    pub value: P::Value,

    /// `None` for leaf entries
    pub child: Option<ProxyId>,
}

#[derive(Clone)]
pub(crate) struct Node<P: Policy> {
    height: u64,
    total: P::Value,
    entries: Vec<Entry<P>>,
}

impl<P: Policy> Node<P> {
    /// Creates a one-element tree.
    pub fn new_leaf(key: P::Key, value: P::Value) -> Self {
        Self {
            height: 0,
            total: value.clone(),
            entries: vec![Entry {
                key,
                value,
                child: None,
            }],
        }
    }

    /// Builds a node from sorted entries, computing the aggregate.
    pub fn from_entries(height: u64, entries: Vec<Entry<P>>, policy: &P) -> Self {
        debug_assert!(!entries.is_empty());

        let mut node = Self {
            height,
            total: entries[0].value.clone(),
            entries,
        };
        node.recompute_total(policy);
        node
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[Entry<P>] {
        &self.entries
    }

    pub fn entry(&self, i: usize) -> &Entry<P> {
        &self.entries[i]
    }

    pub fn first_key(&self) -> &P::Key {
        &self.entries[0].key
    }

    pub fn total(&self) -> &P::Value {
        &self.total
    }

    /// Child proxies of this node, in key order.
    pub fn children(&self) -> impl Iterator<Item = ProxyId> + '_ {
        self.entries.iter().filter_map(|entry| entry.child)
    }

    /// First index whose key is not less than `key`.
    pub fn lower_bound(&self, policy: &P, key: &P::Key) -> usize {
        self.entries.partition_point(|entry| policy.less(&entry.key, key))
    }

    /// First index whose key is greater than `key`.
    pub fn upper_bound(&self, policy: &P, key: &P::Key) -> usize {
        self.entries.partition_point(|entry| !policy.less(key, &entry.key))
    }

    /// Index of the entry holding `key`, if present.
    pub fn find(&self, policy: &P, key: &P::Key) -> Option<usize> {
        let i = self.lower_bound(policy, key);

        if i < self.len() && !policy.less(key, &self.entries[i].key) {
            Some(i)
        } else {
            None
        }
    }

    /// Index of the child subtree an update of `key` descends into:
    /// the last child whose first key is not greater than `key`.
    pub fn child_index(&self, policy: &P, key: &P::Key) -> usize {
        self.upper_bound(policy, key).saturating_sub(1)
    }

    /// Removes the single remaining entry and hands out its child
    /// reference (used for root collapse).
    pub fn take_only_child(&mut self) -> Option<ProxyId> {
        debug_assert_eq!(1, self.len());
        self.entries.pop().and_then(|entry| entry.child)
    }

    pub fn recompute_total(&mut self, policy: &P) {
        debug_assert!(!self.entries.is_empty());

        let mut total = self.entries[0].value.clone();
        for entry in &self.entries[1..] {
            policy.aggregate(&mut total, &entry.value);
        }
        self.total = total;
    }

    fn insert_entry(&mut self, policy: &P, entry: Entry<P>) {
        let at = self.lower_bound(policy, &entry.key);
        self.entries.insert(at, entry);
    }

    /// Splits off the upper half if the node is over capacity; always
    /// leaves the aggregate(s) recomputed.
    fn maybe_split(&mut self, policy: &P) -> Option<Self> {
        if self.len() <= P::max_size() {
            self.recompute_total(policy);
            return None;
        }

        let keep = self.len() / 2;
        let upper = self.entries.split_off(keep);

        let sibling = Self::from_entries(self.height, upper, policy);
        self.recompute_total(policy);

        Some(sibling)
    }

    /// Installs a freshly-edited child node at entry `i`, registering it
    /// with the cache and releasing the previous child.
    fn install_child(
        &mut self,
        cache: &Cache<P>,
        policy: &P,
        i: usize,
        child: Self,
    ) -> crate::Result<()> {
        let key = child.first_key().clone();
        let total = child.total().clone();
        let id = cache.new_node(child, policy.clone())?;

        let entry = &mut self.entries[i];
        entry.key = key;
        entry.value = total;

        if let Some(old) = entry.child.replace(id) {
            cache.release(old);
        }

        Ok(())
    }

    /// Rewrites the peer entry after a steal or merge.
    fn replace_child_entry(
        &mut self,
        cache: &Cache<P>,
        i: usize,
        id: ProxyId,
        key: P::Key,
        total: P::Value,
    ) {
        let entry = &mut self.entries[i];
        entry.key = key;
        entry.value = total;

        if let Some(old) = entry.child.replace(id) {
            cache.release(old);
        }
    }

    fn remove_entry_and_release(&mut self, cache: &Cache<P>, i: usize) {
        let entry = self.entries.remove(i);
        if let Some(child) = entry.child {
            cache.release(child);
        }
    }

    /// Applies `updater` to the location addressed by `key`.
    ///
    /// `peer` is the sibling entry the parent designated for rebalancing;
    /// `None` only at the root.
    pub fn update<U: Updater<P::Value>>(
        &mut self,
        cache: &Cache<P>,
        policy: &P,
        key: &P::Key,
        peer: Option<ProxyId>,
        updater: U,
    ) -> crate::Result<UpdateResult<P>> {
        if self.height == 0 {
            let found = self.find(policy, key);

            return match updater.apply(found.map(|i| &self.entries[i].value)) {
                Outcome::Keep => Ok(UpdateResult::Nop),
                Outcome::Remove => {
                    let Some(i) = found else {
                        return Ok(UpdateResult::Nop);
                    };

                    self.entries.remove(i);
                    self.erase_fixup(cache, policy, peer)
                }
                Outcome::Put(value) => {
                    if let Some(i) = found {
                        self.entries[i].value = value;
                        self.recompute_total(policy);
                        return Ok(UpdateResult::Modify);
                    }

                    self.insert_entry(
                        policy,
                        Entry {
                            key: key.clone(),
                            value,
                            child: None,
                        },
                    );

                    Ok(match self.maybe_split(policy) {
                        Some(sibling) => UpdateResult::Split(Box::new(sibling)),
                        None => UpdateResult::Insert,
                    })
                }
            };
        }

        // Interior: descend into the child owning the key, handing it the
        // next entry over as its rebalancing peer
        let i = self.child_index(policy, key);
        let peer_index = if i == self.len() - 1 { i - 1 } else { i + 1 };

        let child_id = self.entries[i]
            .child
            .unwrap_or_else(|| unreachable!("interior entry has no child"));
        let child_peer = self.entries[peer_index].child;

        let mut child = cache.copy_node(child_id)?;

        match child.update(cache, policy, key, child_peer, updater)? {
            UpdateResult::Nop => {
                cache.discard_node(&child);
                Ok(UpdateResult::Nop)
            }

            result @ (UpdateResult::Modify | UpdateResult::Insert | UpdateResult::Erase) => {
                self.install_child(cache, policy, i, child)?;
                self.recompute_total(policy);
                Ok(result)
            }

            UpdateResult::Split(sibling) => {
                self.install_child(cache, policy, i, child)?;

                let sibling = *sibling;
                let sib_key = sibling.first_key().clone();
                let sib_total = sibling.total().clone();
                let sib_id = cache.new_node(sibling, policy.clone())?;

                self.insert_entry(
                    policy,
                    Entry {
                        key: sib_key,
                        value: sib_total,
                        child: Some(sib_id),
                    },
                );

                Ok(match self.maybe_split(policy) {
                    Some(sibling) => UpdateResult::Split(Box::new(sibling)),
                    None => UpdateResult::Insert,
                })
            }

            UpdateResult::Steal {
                peer: new_peer,
                peer_key,
                peer_total,
            } => {
                self.replace_child_entry(cache, peer_index, new_peer, peer_key, peer_total);
                self.install_child(cache, policy, i, child)?;
                self.recompute_total(policy);
                Ok(UpdateResult::Erase)
            }

            UpdateResult::Merge {
                peer: new_peer,
                peer_key,
                peer_total,
            } => {
                // The child's entries moved into the peer copy; only the
                // stale down pointer remains to clean up here
                cache.discard_node(&child);
                self.replace_child_entry(cache, peer_index, new_peer, peer_key, peer_total);
                self.remove_entry_and_release(cache, i);
                self.erase_fixup(cache, policy, peer)
            }

            UpdateResult::Singular | UpdateResult::Empty => {
                unreachable!("non-root child reported a root collapse")
            }
        }
    }

    /// Restores the size invariant after an erase: keep, steal or merge.
    fn erase_fixup(
        &mut self,
        cache: &Cache<P>,
        policy: &P,
        peer: Option<ProxyId>,
    ) -> crate::Result<UpdateResult<P>> {
        if self.len() >= P::min_size() {
            self.recompute_total(policy);
            return Ok(UpdateResult::Erase);
        }

        let Some(peer_id) = peer else {
            // Root: may shrink below min_size until the tree collapses
            if self.entries.is_empty() {
                return Ok(UpdateResult::Empty);
            }

            self.recompute_total(policy);

            if self.height > 0 && self.len() == 1 {
                return Ok(UpdateResult::Singular);
            }

            return Ok(UpdateResult::Erase);
        };

        let mut peer_node = cache.copy_node(peer_id)?;
        let peer_is_left = policy.less(peer_node.first_key(), self.first_key());

        if peer_node.len() > P::min_size() {
            // Steal the peer entry nearest to us
            let steal_at = if peer_is_left { peer_node.len() - 1 } else { 0 };
            let entry = peer_node.entries.remove(steal_at);

            self.insert_entry(policy, entry);
            self.recompute_total(policy);
            peer_node.recompute_total(policy);

            let peer_key = peer_node.first_key().clone();
            let peer_total = peer_node.total().clone();
            let peer = cache.new_node(peer_node, policy.clone())?;

            Ok(UpdateResult::Steal {
                peer,
                peer_key,
                peer_total,
            })
        } else {
            // Fold ourselves into the peer copy, keyed by side
            if peer_is_left {
                peer_node.entries.append(&mut self.entries);
            } else {
                let mut merged = std::mem::take(&mut self.entries);
                merged.append(&mut peer_node.entries);
                peer_node.entries = merged;
            }

            peer_node.recompute_total(policy);

            let peer_key = peer_node.first_key().clone();
            let peer_total = peer_node.total().clone();
            let peer = cache.new_node(peer_node, policy.clone())?;

            Ok(UpdateResult::Merge {
                peer,
                peer_key,
                peer_total,
            })
        }
    }
}
