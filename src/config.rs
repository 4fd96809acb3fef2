// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{slab::DEFAULT_SLAB_GOAL_SIZE, Policy, Store};
use std::path::{Path, PathBuf};

/// Store configuration.
pub struct Config<P: Policy> {
    /// Store directory
    pub(crate) path: PathBuf,

    /// Whether to create the directory if it is missing
    pub(crate) create: bool,

    /// Hard cap on the write-behind queue; exceeding it flushes inline
    pub(crate) max_unwritten: usize,

    /// Soft cap on resident, unpinned cached nodes
    pub(crate) max_lru: usize,

    /// Slab file size at which the log rolls over to a new file
    pub(crate) slab_goal_size: u64,

    /// Default policy for recovered and newly attached trees
    pub(crate) policy: P,
}

impl<P: Policy> Config<P> {
    /// Initializes a new store configuration for the given directory.
    pub fn new<PP: AsRef<Path>>(path: PP, policy: P) -> Self {
        Self {
            path: path.as_ref().into(),
            create: true,
            max_unwritten: 128,
            max_lru: 1_024,
            slab_goal_size: DEFAULT_SLAB_GOAL_SIZE,
            policy,
        }
    }

    /// Sets whether a missing store directory is created (default: true).
    ///
    /// With `create = false`, opening a missing directory fails.
    #[must_use]
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Sets the hard cap on the number of unwritten nodes held in memory
    /// before writers flush inline (default: 128).
    #[must_use]
    pub fn max_unwritten(mut self, n: usize) -> Self {
        self.max_unwritten = n;
        self
    }

    /// Sets the soft cap on resident clean nodes kept for reads
    /// (default: 1024).
    #[must_use]
    pub fn max_lru(mut self, n: usize) -> Self {
        self.max_lru = n;
        self
    }

    /// Sets the slab file goal size (default: 10 MiB).
    #[must_use]
    pub fn slab_goal_size(mut self, bytes: u64) -> Self {
        self.slab_goal_size = bytes;
        self
    }

    /// Opens the store.
    pub fn open(self) -> crate::Result<Store<P>> {
        Store::from_config(self)
    }
}
