// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cache::{arena::ProxyId, Cache},
    tree::node::Node,
    Policy,
};
use std::sync::Arc;

/// Lifecycle state of a proxy.
///
/// ```text
///         new_node            write_front         evict
///  (none) ───────► Unwritten ───────► Cached ◄────────► Unloaded
///                      │   ▲            │ ▲               │
///                      │   │        pin │ │ unpin         │ pin
///                      ▼   │            ▼ │               ▼
///                    Writing          (in use)         Loading
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ProxyState {
    /// Node is new and not yet written to disk
    Unwritten,

    /// Node is being appended to the store right now
    Writing,

    /// Node is on disk and resident in memory
    Cached,

    /// Node is being read back from the store right now
    Loading,

    /// Node is on disk only
    Unloaded,
}

/// Intrusive list links; a proxy is on at most one list at a time
/// (the unwritten queue while `Unwritten`, the LRU while `Cached` and
/// unpinned).
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct ListLink {
    pub prev: Option<ProxyId>,
    pub next: Option<ProxyId>,
}

/// Durable identity handle for one logical node.
///
/// The proxy mediates between the immutable in-memory node (the cacheable
/// payload) and its on-disk offset. `refs` counts owning references (entries
/// of resident parent nodes, tree roots, marks, cursors); `pins` counts
/// transient "reading right now" holds. A proxy is destroyed once both drop
/// to zero.
pub(crate) struct Proxy<P: Policy> {
    pub state: ProxyState,

    /// Owning references; the proxy stays discoverable while > 0
    pub refs: u32,

    /// Transient read holds; eviction is barred while > 0
    pub pins: u32,

    /// The immutable node payload, present in `Unwritten`/`Writing`/`Cached`
    /// (and while `Loading` completes)
    pub node: Option<Arc<Node<P>>>,

    /// On-disk offset; 0 while unwritten
    pub offset: u64,

    /// Minimum offset transitively reachable from this node;
    /// `u64::MAX` while unwritten
    pub oldest: u64,

    /// Node height (0 = leaf); secondary ordering key of the oldest index
    pub height: u64,

    /// Policy used to decode this node's entries
    pub policy: P,

    pub link: ListLink,
}

impl<P: Policy> Proxy<P> {
    pub fn new_unwritten(node: Arc<Node<P>>, policy: P) -> Self {
        Self {
            state: ProxyState::Unwritten,
            refs: 1,
            pins: 0,
            height: node.height(),
            node: Some(node),
            offset: 0,
            oldest: u64::MAX,
            policy,
            link: ListLink::default(),
        }
    }

    pub fn new_unloaded(offset: u64, oldest: u64, height: u64, policy: P) -> Self {
        Self {
            state: ProxyState::Unloaded,
            refs: 1,
            pins: 0,
            node: None,
            offset,
            oldest,
            height,
            policy,
            link: ListLink::default(),
        }
    }
}

/// RAII hold on a proxy: one owning reference plus one pin.
///
/// While a guard is alive the node is resident and its child proxy ids are
/// valid, so cursors stack these along their root-to-leaf path.
pub(crate) struct NodeGuard<P: Policy> {
    cache: Arc<Cache<P>>,
    id: ProxyId,
    node: Arc<Node<P>>,
}

impl<P: Policy> NodeGuard<P> {
    pub(crate) fn new(cache: Arc<Cache<P>>, id: ProxyId, node: Arc<Node<P>>) -> Self {
        Self { cache, id, node }
    }

    pub fn id(&self) -> ProxyId {
        self.id
    }
}

impl<P: Policy> std::ops::Deref for NodeGuard<P> {
    type Target = Node<P>;

    fn deref(&self) -> &Node<P> {
        &self.node
    }
}

impl<P: Policy> Drop for NodeGuard<P> {
    fn drop(&mut self) {
        self.cache.unpin(self.id);
        self.cache.release(self.id);
    }
}
