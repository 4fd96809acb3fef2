// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded, persistent **aggregate B-tree**: an ordered key→value map
//! whose interior nodes additionally cache an associative fold of all
//! descendant values.
//!
//! The cached aggregates turn the tree into a general order-statistic /
//! prefix-sum / spatial-index substrate: range summaries and threshold
//! seeks ("advance until the running sum exceeds N") run in logarithmic
//! time by pruning whole subtrees.
//!
//! ##### About
//!
//! Trees are copy-on-write: an update rebuilds the path from the touched
//! leaf to a new root, so snapshots are O(1) and stay consistent while the
//! live tree moves on. Nodes live in an append-only, multi-file record log
//! behind a pinning node cache with write-behind; a rolling compaction
//! pass rewrites the oldest still-referenced data forward so old log files
//! can be reclaimed wholesale.
//!
//! A [`Store`] binds any number of named trees to one log and one cache;
//! `mark` / `sync` / `revert` form the commit boundary. Key and value
//! types, their ordering, their aggregation and their on-disk encoding
//! all come from a user-supplied [`Policy`].
//!
//! # Example usage
//!
//! ```
//! use agg_btree::{Config, U64SumPolicy};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let store = Config::new(folder.path(), U64SumPolicy).open()?;
//! let tree = store.attach("scores");
//!
//! for k in 0..100 {
//!     tree.set(&k, k)?;
//! }
//!
//! // Range summary in O(log n)
//! assert_eq!(Some(3 + 4 + 5), tree.range_total(&3, &6)?);
//!
//! // Threshold seek: advance until the running sum would exceed 42
//! let mut cursor = tree.start()?;
//! let end = tree.end()?;
//! let mut acc = None;
//!
//! tree.accumulate_until(&mut cursor, &mut acc, &end, |acc| *acc > 42)?;
//!
//! assert_eq!(Some(0 + 1 + 2 + 3 + 4 + 5 + 6 + 7 + 8), acc);
//! assert_eq!(Some(&9), cursor.key()?);
//!
//! // Make the current state durable
//! store.mark();
//! store.sync()?;
//! #
//! # Ok::<(), agg_btree::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

mod cache;
mod coding;
mod config;
mod error;
mod policy;
mod slab;
mod snapshot;
mod store;
mod tree;

pub use {
    coding::{DecodeError, EncodeError},
    config::Config,
    error::{Error, Result},
    policy::{Policy, U64SumPolicy},
    snapshot::Snapshot,
    store::Store,
    tree::{
        cursor::{Cursor, Iter},
        subset::SubsetIter,
        Tree,
    },
};
