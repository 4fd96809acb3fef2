// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Multi-tree store: named roots over one cache and one slab log.
//!
//! `mark` snapshots the current roots of every named tree, `sync` makes
//! the last mark durable as one root record (the atomic commit boundary),
//! and `revert` rolls the trees back to the last mark without touching
//! disk.

use crate::{
    cache::Cache,
    coding::DecodeError,
    slab::SlabStore,
    tree::{RootRef, Tree},
    Config, Policy, Snapshot,
};
use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};
use varint_rs::{VarintReader, VarintWriter};

struct Roots<P: Policy> {
    current: BTreeMap<String, Tree<P>>,
    mark: BTreeMap<String, Snapshot<P>>,
    synced: bool,
}

/// A store binds any number of named trees to one node cache and one
/// append-only slab log.
pub struct Store<P: Policy> {
    cache: Arc<Cache<P>>,
    slabs: Arc<SlabStore>,
    policy: P,

    /// The "mark lock": at most one commit-boundary operation
    /// (`mark` / `revert` / `sync`) mutates the named-roots map at a time
    roots: Mutex<Roots<P>>,
}

impl<P: Policy> Store<P> {
    /// Opens a store directory, recovering all named trees from the most
    /// recent root record.
    ///
    /// Equivalent to [`Config::open`] with the given knobs.
    pub fn open(
        path: &Path,
        create: bool,
        max_unwritten: usize,
        max_lru: usize,
        policy: P,
    ) -> crate::Result<Self> {
        Config::new(path, policy)
            .create(create)
            .max_unwritten(max_unwritten)
            .max_lru(max_lru)
            .open()
    }

    pub(crate) fn from_config(config: Config<P>) -> crate::Result<Self> {
        let slabs = Arc::new(SlabStore::open(
            &config.path,
            config.create,
            config.slab_goal_size,
        )?);

        let cache = Arc::new(Cache::new(
            slabs.clone(),
            config.max_unwritten,
            config.max_lru,
        ));

        let policy = config.policy;

        let mut current = BTreeMap::new();

        if let Some(buf) = slabs.read_root()? {
            let mut reader = &buf[..];

            let count = reader.read_u64_varint()?;

            for _ in 0..count {
                let name_len = reader.read_u64_varint()? as usize;

                let mut name = vec![0u8; name_len];
                std::io::Read::read_exact(&mut reader, &mut name)
                    .map_err(|_| crate::Error::Decode(DecodeError::UnexpectedEof("tree name")))?;
                let name = std::str::from_utf8(&name)
                    .map_err(|e| crate::Error::Decode(DecodeError::Utf8(e)))?
                    .to_owned();

                let offset = reader.read_u64_varint()?;
                let oldest = reader.read_u64_varint()?;
                let height = reader.read_u64_varint()?;
                let len = reader.read_u64_varint()?;

                let root = if offset == 0 {
                    None
                } else {
                    let node_height = height.saturating_sub(1);
                    let id = cache.lookup(offset, oldest, node_height, &policy);
                    Some(RootRef::adopt(cache.clone(), id))
                };

                current.insert(
                    name,
                    Tree::with_root(cache.clone(), policy.clone(), root, height, len),
                );
            }
        }

        log::debug!(
            "Opened store at {:?} with {} named tree(s)",
            config.path,
            current.len(),
        );

        // The recovered state counts as marked and durable, so a stray
        // `sync` before the first `mark` cannot commit an empty root set
        let mark = current
            .iter()
            .map(|(name, tree)| (name.clone(), tree.snapshot()))
            .collect();

        Ok(Self {
            cache,
            slabs,
            policy,
            roots: Mutex::new(Roots {
                current,
                mark,
                synced: true,
            }),
        })
    }

    fn lock_roots(&self) -> MutexGuard<'_, Roots<P>> {
        self.roots.lock().expect("mark lock is poisoned")
    }

    /// Returns the named tree, creating an empty one if it does not exist,
    /// using the store's default policy.
    pub fn attach(&self, name: &str) -> Tree<P> {
        self.attach_with(name, self.policy.clone())
    }

    /// Returns the named tree bound to `policy`, creating an empty one if
    /// it does not exist.
    ///
    /// Re-attaching an existing tree installs the new policy down the
    /// resident part of the tree. Changing the *comparator* of a tree that
    /// already contains keys leaves the stored order as it was, which is
    /// almost never what you want; caller beware.
    pub fn attach_with(&self, name: &str, policy: P) -> Tree<P> {
        let mut roots = self.lock_roots();

        if let Some(tree) = roots.current.get(name) {
            tree.set_policy(policy.clone());

            if let Some(root) = tree.root_id() {
                self.cache.update_policy(root, &policy);
            }

            return tree.clone();
        }

        let tree = Tree::new(self.cache.clone(), policy);
        roots.current.insert(name.to_owned(), tree.clone());
        tree
    }

    /// Names of all attached trees.
    pub fn tree_names(&self) -> Vec<String> {
        self.lock_roots().current.keys().cloned().collect()
    }

    /// Snapshots the current roots of all named trees as the commit
    /// candidate for the next [`Store::sync`].
    pub fn mark(&self) {
        let mut roots = self.lock_roots();

        roots.mark = roots
            .current
            .iter()
            .map(|(name, tree)| (name.clone(), tree.snapshot()))
            .collect();
        roots.synced = false;
    }

    /// Rolls every named tree back to the last [`Store::mark`], in memory
    /// only. Trees attached after the mark are dropped (their handles stay
    /// usable but empty).
    pub fn revert(&self) {
        let mut roots = self.lock_roots();

        let mark = std::mem::take(&mut roots.mark);

        roots.current.retain(|name, tree| {
            if let Some(snapshot) = mark.get(name) {
                tree.restore(snapshot);
                true
            } else {
                tree.clear();
                false
            }
        });

        roots.mark = mark;
    }

    /// Makes the last [`Store::mark`] durable: flushes every reachable
    /// unwritten node, writes one root record naming all marked roots,
    /// fsyncs, and truncates slabs older than the oldest reachable node.
    ///
    /// A second `sync` without an intervening `mark` is a no-op.
    pub fn sync(&self) -> crate::Result<()> {
        let roots = self.lock_roots();

        if roots.synced {
            return Ok(());
        }

        // Hold off compaction so the offsets we record cannot be forwarded
        // away before the record is durable
        let _gc = self.cache.gc_guard();

        for snapshot in roots.mark.values() {
            if let Some(id) = snapshot.root_id() {
                self.cache.flush_until_written(id)?;
            }
        }

        let mut buf = vec![];
        buf.write_u64_varint(roots.mark.len() as u64)?;

        for (name, snapshot) in &roots.mark {
            buf.write_u64_varint(name.len() as u64)?;
            buf.extend_from_slice(name.as_bytes());

            let (offset, oldest) = match snapshot.root_id() {
                Some(id) => self.cache.location(id),
                None => (0, 0),
            };

            buf.write_u64_varint(offset)?;
            buf.write_u64_varint(oldest)?;
            buf.write_u64_varint(snapshot.height())?;
            buf.write_u64_varint(snapshot.len())?;
        }

        self.slabs.write_root(&buf)?;
        self.slabs.persist()?;

        let mut roots = roots;
        roots.synced = true;
        drop(roots);

        self.cache.trim_lru();

        // Nothing reachable lives below the oldest live node anymore
        if let Some(oldest) = self.cache.min_oldest() {
            self.slabs.clear_before(oldest)?;
        }

        Ok(())
    }

    /// Runs one compaction pass by hand (updates already run these
    /// continuously); see the crate docs on compaction.
    pub fn clean_one(&self) -> crate::Result<bool> {
        self.cache.clean_one()
    }

    /// Number of slab files currently backing the store.
    pub fn slab_count(&self) -> usize {
        self.slabs.slab_count()
    }
}
