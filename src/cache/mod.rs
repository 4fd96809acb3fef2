// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Node cache and proxy lifecycle.
//!
//! The cache owns every proxy (see [`proxy::Proxy`]) in a slot arena and
//! tracks them through four structures:
//!
//! - the *unwritten queue*: proxies awaiting write-behind, drained FIFO,
//! - the *LRU list*: resident, unpinned proxies, evicted from the front,
//! - the *offset index*: at most one proxy per on-disk node, preserving
//!   identity across load/unload cycles,
//! - the *oldest index*: proxies ordered by `(oldest, -height, id)`,
//!   driving compaction.
//!
//! One mutex guards all of them; the expensive parts (disk reads and
//! writes) run with the lock dropped, protected only by the per-proxy
//! state machine. Writes are additionally serialized through `in_write`.

pub(crate) mod arena;
pub(crate) mod proxy;

use crate::{
    coding::DecodeError,
    slab::SlabStore,
    tree::node::{Entry, Node},
    Policy,
};
use arena::{Arena, ProxyId};
use proxy::{NodeGuard, Proxy, ProxyState};
use rustc_hash::FxHashMap;
use std::{
    cmp::Reverse,
    collections::BTreeSet,
    sync::{Arc, Condvar, Mutex, MutexGuard},
};
use varint_rs::{VarintReader, VarintWriter};

/// Ordering key of the oldest index.
///
/// The descending height tiebreaker makes compaction visit ancestors before
/// descendants within one generation, so forwarding a parent finds its
/// children already re-proxied at their new offsets.
type OldestKey = (u64, Reverse<u64>, ProxyId);

#[derive(Default)]
struct LinkedList {
    head: Option<ProxyId>,
    tail: Option<ProxyId>,
    len: usize,
}

impl LinkedList {
    fn push_back<P: Policy>(&mut self, proxies: &mut Arena<Proxy<P>>, id: ProxyId) {
        let link = &proxies.get(id).link;
        debug_assert!(link.prev.is_none() && link.next.is_none());

        match self.tail {
            Some(tail) => {
                proxies.get_mut(tail).link.next = Some(id);
                proxies.get_mut(id).link.prev = Some(tail);
            }
            None => self.head = Some(id),
        }

        self.tail = Some(id);
        self.len += 1;
    }

    fn push_front<P: Policy>(&mut self, proxies: &mut Arena<Proxy<P>>, id: ProxyId) {
        let link = &proxies.get(id).link;
        debug_assert!(link.prev.is_none() && link.next.is_none());

        match self.head {
            Some(head) => {
                proxies.get_mut(head).link.prev = Some(id);
                proxies.get_mut(id).link.next = Some(head);
            }
            None => self.tail = Some(id),
        }

        self.head = Some(id);
        self.len += 1;
    }

    fn unlink<P: Policy>(&mut self, proxies: &mut Arena<Proxy<P>>, id: ProxyId) {
        let link = std::mem::take(&mut proxies.get_mut(id).link);

        match link.prev {
            Some(prev) => proxies.get_mut(prev).link.next = link.next,
            None => self.head = link.next,
        }

        match link.next {
            Some(next) => proxies.get_mut(next).link.prev = link.prev,
            None => self.tail = link.prev,
        }

        self.len -= 1;
    }

    fn pop_front<P: Policy>(&mut self, proxies: &mut Arena<Proxy<P>>) -> Option<ProxyId> {
        let id = self.head?;
        self.unlink(proxies, id);
        Some(id)
    }

    fn len(&self) -> usize {
        self.len
    }
}

pub(crate) struct CacheInner<P: Policy> {
    proxies: Arena<Proxy<P>>,

    /// Proxies in state `Unwritten`, in arrival order
    unwritten: LinkedList,

    /// Proxies in state `Cached` with pin count zero
    lru: LinkedList,

    /// Disk offset → proxy
    by_offset: FxHashMap<u64, ProxyId>,

    /// Written proxies ordered by `(oldest, -height, id)`
    oldest: BTreeSet<OldestKey>,

    /// Writer-exclusion flag; at most one flush is in flight
    in_write: bool,
}

/// The shared node cache of one store.
pub(crate) struct Cache<P: Policy> {
    store: Arc<SlabStore>,
    max_unwritten: usize,
    max_lru: usize,
    inner: Mutex<CacheInner<P>>,

    /// Signalled when a load completes (or fails)
    load_done: Condvar,

    /// Signalled when the in-flight write completes
    write_done: Condvar,

    /// Serializes compaction passes against the commit boundary, so a
    /// just-recorded root offset cannot be forwarded away before the root
    /// record referencing it is durable
    gc: Mutex<()>,
}

impl<P: Policy> Cache<P> {
    pub fn new(store: Arc<SlabStore>, max_unwritten: usize, max_lru: usize) -> Self {
        Self {
            store,
            max_unwritten: max_unwritten.max(1),
            max_lru: max_lru.max(1),
            inner: Mutex::new(CacheInner {
                proxies: Arena::new(),
                unwritten: LinkedList::default(),
                lru: LinkedList::default(),
                by_offset: FxHashMap::default(),
                oldest: BTreeSet::new(),
                in_write: false,
            }),
            load_done: Condvar::new(),
            write_done: Condvar::new(),
            gc: Mutex::new(()),
        }
    }

    /// Blocks compaction for the duration of the returned guard.
    pub fn gc_guard(&self) -> MutexGuard<'_, ()> {
        self.gc.lock().expect("gc lock is poisoned")
    }

    fn lock_inner(&self) -> MutexGuard<'_, CacheInner<P>> {
        self.inner.lock().expect("cache lock is poisoned")
    }

    /// Adds one owning reference.
    pub fn acquire(&self, id: ProxyId) {
        let mut guard = self.lock_inner();
        guard.proxies.get_mut(id).refs += 1;
    }

    /// Drops one owning reference, destroying the proxy once idle.
    pub fn release(&self, id: ProxyId) {
        let mut guard = self.lock_inner();
        dec_locked(&mut guard, id);
    }

    /// Pins the proxy and returns its resident node, loading it from the
    /// store first if needed.
    pub fn pin(&self, id: ProxyId) -> crate::Result<Arc<Node<P>>> {
        let mut guard = self.lock_inner();

        loop {
            let inner = &mut *guard;
            let proxy = inner.proxies.get_mut(id);

            match proxy.state {
                ProxyState::Unwritten | ProxyState::Writing | ProxyState::Cached => {
                    proxy.pins += 1;

                    if proxy.state == ProxyState::Cached && proxy.pins == 1 {
                        inner.lru.unlink(&mut inner.proxies, id);
                    }

                    let node = inner
                        .proxies
                        .get(id)
                        .node
                        .clone()
                        .unwrap_or_else(|| unreachable!("resident proxy has no node"));

                    return Ok(node);
                }

                ProxyState::Loading => {
                    guard = self.load_done.wait(guard).expect("cache lock is poisoned");
                }

                ProxyState::Unloaded => {
                    proxy.pins += 1;
                    debug_assert_eq!(1, proxy.pins);
                    proxy.state = ProxyState::Loading;

                    let offset = proxy.offset;
                    let policy = proxy.policy.clone();

                    // The read happens without the cache lock
                    drop(guard);
                    let bytes = self.store.read_node(offset);
                    guard = self.lock_inner();

                    let decoded =
                        bytes.and_then(|bytes| decode_node(&mut guard, &bytes, &policy));

                    let inner = &mut *guard;

                    match decoded {
                        Ok(node) => {
                            let node = Arc::new(node);
                            let proxy = inner.proxies.get_mut(id);
                            debug_assert_eq!(proxy.height, node.height());
                            proxy.node = Some(node.clone());
                            proxy.state = ProxyState::Cached;
                            self.load_done.notify_all();
                            return Ok(node);
                        }
                        Err(e) => {
                            let proxy = inner.proxies.get_mut(id);
                            proxy.state = ProxyState::Unloaded;
                            proxy.pins -= 1;

                            if proxy.refs == 0 && proxy.pins == 0 {
                                destroy_locked(inner, id);
                            }

                            self.load_done.notify_all();
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Releases one pin; the last unpinner moves a cached proxy to the LRU
    /// tail and evicts from the front while over capacity.
    pub fn unpin(&self, id: ProxyId) {
        let mut guard = self.lock_inner();
        self.unpin_locked(&mut guard, id);
    }

    fn unpin_locked(&self, guard: &mut CacheInner<P>, id: ProxyId) {
        let proxy = guard.proxies.get_mut(id);
        debug_assert!(proxy.pins > 0);
        proxy.pins -= 1;

        if proxy.pins > 0 {
            return;
        }

        if proxy.state == ProxyState::Cached {
            guard.lru.push_back(&mut guard.proxies, id);
        }

        if guard.proxies.get(id).refs == 0 {
            // A release during the pin was deferred to us
            destroy_locked(guard, id);
        } else {
            evict_over_capacity(guard, self.max_lru);
        }
    }

    /// Takes one owning reference plus a pin, as an RAII guard.
    pub fn node_guard(self: &Arc<Self>, id: ProxyId) -> crate::Result<NodeGuard<P>> {
        self.acquire(id);

        match self.pin(id) {
            Ok(node) => Ok(NodeGuard::new(self.clone(), id, node)),
            Err(e) => {
                self.release(id);
                Err(e)
            }
        }
    }

    /// Registers a freshly-built node, enqueueing it for write-behind.
    /// Returns the proxy with one owning reference.
    ///
    /// If the unwritten queue exceeds its cap, the front is flushed inline;
    /// a failing flush leaves the queue intact and surfaces the error.
    pub fn new_node(&self, node: Node<P>, policy: P) -> crate::Result<ProxyId> {
        let mut guard = self.lock_inner();

        let inner = &mut *guard;
        let id = inner.proxies.insert(Proxy::new_unwritten(Arc::new(node), policy));
        inner.unwritten.push_back(&mut inner.proxies, id);

        while guard.unwritten.len() > self.max_unwritten {
            guard = self.write_front(guard)?;
        }

        Ok(id)
    }

    /// Returns the proxy for an on-disk node, creating an unloaded one if
    /// none exists; at most one proxy per offset ever exists.
    pub fn lookup(&self, offset: u64, oldest: u64, height: u64, policy: &P) -> ProxyId {
        let mut guard = self.lock_inner();
        lookup_locked(&mut guard, offset, oldest, height, policy)
    }

    /// Deep-copies the node behind `id` into a private, writable copy,
    /// adding one owning reference per child.
    pub fn copy_node(&self, id: ProxyId) -> crate::Result<Node<P>> {
        let node = self.pin(id)?;
        let copy = (*node).clone();

        let mut guard = self.lock_inner();

        for child in copy.children() {
            guard.proxies.get_mut(child).refs += 1;
        }

        self.unpin_locked(&mut guard, id);

        Ok(copy)
    }

    /// Discards a private node copy, dropping its child references.
    pub fn discard_node(&self, node: &Node<P>) {
        let mut guard = self.lock_inner();
        drop_node_locked(&mut guard, node);
    }

    /// Flushes the unwritten queue until the given proxy is on disk.
    pub fn flush_until_written(&self, id: ProxyId) -> crate::Result<()> {
        let mut guard = self.lock_inner();

        loop {
            match guard.proxies.get(id).state {
                ProxyState::Unwritten => {
                    guard = self.write_front(guard)?;
                }
                ProxyState::Writing => {
                    guard = self.write_done.wait(guard).expect("cache lock is poisoned");
                }
                _ => return Ok(()),
            }
        }
    }

    /// Returns `(offset, oldest)` of a written proxy.
    pub fn location(&self, id: ProxyId) -> (u64, u64) {
        let guard = self.lock_inner();
        let proxy = guard.proxies.get(id);
        debug_assert!(proxy.offset != 0, "location of unwritten proxy");
        (proxy.offset, proxy.oldest)
    }

    /// Smallest `oldest` over all written proxies.
    pub fn min_oldest(&self) -> Option<u64> {
        let guard = self.lock_inner();
        guard.oldest.iter().next().map(|&(oldest, _, _)| oldest)
    }

    /// Evicts until the LRU is within capacity.
    pub fn trim_lru(&self) {
        let mut guard = self.lock_inner();
        evict_over_capacity(&mut guard, self.max_lru);
    }

    /// Re-applies a policy to every resident proxy below `id`.
    pub fn update_policy(&self, id: ProxyId, policy: &P) {
        let mut guard = self.lock_inner();
        update_policy_locked(&mut guard, id, policy);
    }

    /// One compaction pass: forwards every node of the oldest written
    /// generation to the head of the log so the slab holding that
    /// generation becomes reclaimable.
    ///
    /// Returns `false` if there was nothing to forward or the pass was
    /// abandoned because a concurrent mutation disturbed the generation.
    pub fn clean_one(&self) -> crate::Result<bool> {
        let _gc = self.gc_guard();
        let mut guard = self.lock_inner();

        let Some(&(target, _, _)) = guard.oldest.iter().next() else {
            return Ok(false);
        };

        // Collect the generation in index order (ancestors first), pinning
        // as we go. Pinning an unloaded proxy drops the lock, so the prefix
        // is re-validated after every pin and the pass is abandoned if a
        // concurrent mutation disturbed it.
        let mut collected: Vec<ProxyId> = vec![];

        let complete = loop {
            let generation: Vec<ProxyId> = guard
                .oldest
                .iter()
                .take_while(|&&(oldest, _, _)| oldest == target)
                .map(|&(_, _, id)| id)
                .collect();

            if guard.oldest.iter().next().map(|&(oldest, _, _)| oldest) != Some(target)
                || generation.len() < collected.len()
                || generation.get(..collected.len()) != Some(&collected[..])
            {
                break false;
            }

            if generation.len() == collected.len() {
                break true;
            }

            let next = generation[collected.len()];

            // Keep it reachable across the unlock; pinning may have to load
            guard.proxies.get_mut(next).refs += 1;

            drop(guard);
            match self.pin(next) {
                Ok(_) => collected.push(next),
                Err(e) => {
                    self.release(next);
                    self.release_collected(&collected);
                    return Err(e);
                }
            }
            guard = self.lock_inner();
        };

        if !complete || collected.is_empty() {
            drop(guard);
            self.release_collected(&collected);
            return Ok(false);
        }

        log::debug!(
            "Compaction: forwarding {} node(s) of generation {target}",
            collected.len(),
        );

        // Forward: cached → unwritten, at the *front* of the queue.
        // Ancestors are pushed first, so descendants end up in front of
        // them and are rewritten first; parents then serialize the fresh
        // child offsets through the stable proxy identity.
        {
            let inner = &mut *guard;

            for &id in &collected {
                let proxy = inner.proxies.get_mut(id);
                debug_assert_eq!(ProxyState::Cached, proxy.state);
                debug_assert!(proxy.pins > 0);

                inner.oldest.remove(&(proxy.oldest, Reverse(proxy.height), id));
                inner.by_offset.remove(&proxy.offset);

                proxy.state = ProxyState::Unwritten;
                proxy.offset = 0;
                proxy.oldest = u64::MAX;

                inner.unwritten.push_front(&mut inner.proxies, id);
            }
        }

        // Drain until the forwarded set is on disk again
        while collected
            .iter()
            .any(|&id| matches!(guard.proxies.get(id).state, ProxyState::Unwritten | ProxyState::Writing))
        {
            guard = match self.write_front(guard) {
                Ok(guard) => guard,
                Err(e) => {
                    self.release_collected(&collected);
                    return Err(e);
                }
            };
        }

        for &id in &collected {
            self.unpin_locked(&mut guard, id);
            dec_locked(&mut guard, id);
        }

        Ok(true)
    }

    /// Drops the pin and the keep-alive reference taken during collection.
    fn release_collected(&self, collected: &[ProxyId]) {
        let mut guard = self.lock_inner();
        for &id in collected {
            self.unpin_locked(&mut guard, id);
            dec_locked(&mut guard, id);
        }
    }

    /// Writes the front of the unwritten queue, dropping the cache lock for
    /// the disk append. At most one write is in flight at a time.
    fn write_front<'a>(
        &'a self,
        mut guard: MutexGuard<'a, CacheInner<P>>,
    ) -> crate::Result<MutexGuard<'a, CacheInner<P>>> {
        while guard.in_write {
            guard = self.write_done.wait(guard).expect("cache lock is poisoned");
        }

        let inner = &mut *guard;

        let Some(id) = inner.unwritten.pop_front(&mut inner.proxies) else {
            return Ok(guard);
        };

        let proxy = inner.proxies.get_mut(id);
        debug_assert_eq!(ProxyState::Unwritten, proxy.state);

        proxy.pins += 1;
        proxy.state = ProxyState::Writing;
        inner.in_write = true;

        let node = proxy
            .node
            .clone()
            .unwrap_or_else(|| unreachable!("unwritten proxy has no node"));
        let policy = proxy.policy.clone();

        // Serialization is memory-only and stays under the lock (it reads
        // child offsets out of the arena); only the append is unlocked.
        let bytes = match encode_node(&inner.proxies, &node, &policy) {
            Ok(bytes) => bytes,
            Err(e) => {
                let proxy = inner.proxies.get_mut(id);
                proxy.pins -= 1;
                proxy.state = ProxyState::Unwritten;
                inner.unwritten.push_front(&mut inner.proxies, id);
                inner.in_write = false;
                self.write_done.notify_all();
                return Err(e);
            }
        };

        drop(guard);
        let result = self.store.write_node(&bytes);
        let mut guard = self.lock_inner();

        let inner = &mut *guard;
        inner.in_write = false;

        match result {
            Err(e) => {
                // Leave the queue intact; the error surfaces to the caller
                let proxy = inner.proxies.get_mut(id);
                proxy.pins -= 1;
                proxy.state = ProxyState::Unwritten;
                inner.unwritten.push_front(&mut inner.proxies, id);
                self.write_done.notify_all();
                Err(e)
            }
            Ok(offset) => {
                let mut oldest = offset;
                for child in node.children() {
                    oldest = oldest.min(inner.proxies.get(child).oldest);
                }

                let proxy = inner.proxies.get_mut(id);
                proxy.offset = offset;
                proxy.oldest = oldest;
                proxy.state = ProxyState::Cached;

                let height = proxy.height;
                inner.by_offset.insert(offset, id);
                inner.oldest.insert((oldest, Reverse(height), id));

                self.write_done.notify_all();
                self.unpin_locked(&mut guard, id);

                Ok(guard)
            }
        }
    }
}

fn lookup_locked<P: Policy>(
    inner: &mut CacheInner<P>,
    offset: u64,
    oldest: u64,
    height: u64,
    policy: &P,
) -> ProxyId {
    debug_assert!(offset != 0);

    if let Some(&id) = inner.by_offset.get(&offset) {
        inner.proxies.get_mut(id).refs += 1;
        id
    } else {
        let id = inner
            .proxies
            .insert(Proxy::new_unloaded(offset, oldest, height, policy.clone()));
        inner.by_offset.insert(offset, id);
        inner.oldest.insert((oldest, Reverse(height), id));
        id
    }
}

fn dec_locked<P: Policy>(inner: &mut CacheInner<P>, id: ProxyId) {
    let proxy = inner.proxies.get_mut(id);
    debug_assert!(proxy.refs > 0);
    proxy.refs -= 1;

    // While pinned (including the flusher's own pin during a write and the
    // loader's during a load), destruction is deferred to the last unpin.
    if proxy.refs == 0 && proxy.pins == 0 {
        destroy_locked(inner, id);
    }
}

/// Destroys an idle proxy (refs == 0, pins == 0), unhooking it from every
/// index and dropping its child references.
fn destroy_locked<P: Policy>(inner: &mut CacheInner<P>, id: ProxyId) {
    {
        let proxy = inner.proxies.get(id);
        debug_assert!(proxy.refs == 0 && proxy.pins == 0);

        match proxy.state {
            ProxyState::Unwritten => {
                inner.unwritten.unlink(&mut inner.proxies, id);
            }
            ProxyState::Cached => {
                let (offset, oldest, height) = {
                    let proxy = inner.proxies.get(id);
                    (proxy.offset, proxy.oldest, proxy.height)
                };
                inner.lru.unlink(&mut inner.proxies, id);
                inner.by_offset.remove(&offset);
                inner.oldest.remove(&(oldest, Reverse(height), id));
            }
            ProxyState::Unloaded => {
                let proxy = inner.proxies.get(id);
                let key = (proxy.oldest, Reverse(proxy.height), id);
                let offset = proxy.offset;
                inner.by_offset.remove(&offset);
                inner.oldest.remove(&key);
            }
            ProxyState::Writing | ProxyState::Loading => {
                debug_assert!(false, "destroying busy proxy");
                return;
            }
        }
    }

    let proxy = inner.proxies.remove(id);

    if let Some(node) = proxy.node {
        drop_node_locked(inner, &node);
    }
}

/// Drops one owning reference per child of `node`.
fn drop_node_locked<P: Policy>(inner: &mut CacheInner<P>, node: &Node<P>) {
    for child in node.children() {
        dec_locked(inner, child);
    }
}

/// Evicts from the LRU front while over capacity: the node is dropped, the
/// proxy becomes `Unloaded`, and an unreferenced proxy is destroyed along
/// with its index entries.
fn evict_over_capacity<P: Policy>(inner: &mut CacheInner<P>, max_lru: usize) {
    while inner.lru.len() > max_lru {
        let Some(id) = inner.lru.pop_front(&mut inner.proxies) else {
            break;
        };

        let proxy = inner.proxies.get_mut(id);
        debug_assert_eq!(ProxyState::Cached, proxy.state);
        debug_assert_eq!(0, proxy.pins);

        let node = proxy.node.take();
        proxy.state = ProxyState::Unloaded;

        if proxy.refs == 0 {
            let key = (proxy.oldest, Reverse(proxy.height), id);
            let offset = proxy.offset;
            inner.by_offset.remove(&offset);
            inner.oldest.remove(&key);
            inner.proxies.remove(id);
        }

        if let Some(node) = node {
            drop_node_locked(inner, &node);
        }
    }
}

fn update_policy_locked<P: Policy>(inner: &mut CacheInner<P>, id: ProxyId, policy: &P) {
    inner.proxies.get_mut(id).policy = policy.clone();

    let node = inner.proxies.get(id).node.clone();

    if let Some(node) = node {
        for child in node.children() {
            update_policy_locked(inner, child, policy);
        }
    }
}

/// Serializes a node: `height | count | (entry | child offset+oldest)*`.
///
/// Children are always flushed before their parents (FIFO on bottom-up
/// enqueue order, and front-of-queue forwarding during compaction), so
/// every child has a valid offset here.
fn encode_node<P: Policy>(
    proxies: &Arena<Proxy<P>>,
    node: &Node<P>,
    policy: &P,
) -> crate::Result<Vec<u8>> {
    let mut buf = vec![];

    buf.write_u64_varint(node.height())?;
    buf.write_u64_varint(node.len() as u64)?;

    for entry in node.entries() {
        policy
            .encode_entry(&mut buf, &entry.key, &entry.value)
            .map_err(crate::Error::Encode)?;

        if node.height() > 0 {
            let Some(child) = entry.child else {
                unreachable!("interior entry has no child");
            };

            let child = proxies.get(child);
            debug_assert!(child.offset != 0, "child written before parent");

            buf.write_u64_varint(child.offset)?;
            buf.write_u64_varint(child.oldest)?;
        }
    }

    Ok(buf)
}

/// Deserializes a node, re-establishing children through the offset index
/// so proxy identity is preserved.
fn decode_node<P: Policy>(
    inner: &mut CacheInner<P>,
    bytes: &[u8],
    policy: &P,
) -> crate::Result<Node<P>> {
    let mut reader = bytes;

    let height = reader.read_u64_varint()?;
    let count = reader.read_u64_varint()?;

    if count == 0 {
        return Err(crate::Error::Decode(DecodeError::InvalidHeader("empty node")));
    }

    let mut entries = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let (key, value) = policy
            .decode_entry(&mut reader)
            .map_err(crate::Error::Decode)?;

        let child = if height > 0 {
            let offset = reader.read_u64_varint()?;
            let oldest = reader.read_u64_varint()?;
            Some(lookup_locked(inner, offset, oldest, height - 1, policy))
        } else {
            None
        };

        entries.push(Entry { key, value, child });
    }

    Ok(Node::from_entries(height, entries, policy))
}
