// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Defines the key and value types of a tree, together with their ordering,
/// their aggregation, and their on-disk encoding.
///
/// The aggregation must be associative; the aggregate of a single value is
/// the value itself, so no identity element is required.
///
/// The byte-level encoding of an entry is entirely owned by the policy; the
/// tree core treats entries as opaque.
pub trait Policy: Clone + Send + Sync + 'static {
    /// Key type
    type Key: Clone + Send + Sync + 'static;

    /// Value type
    type Value: Clone + Send + Sync + 'static;

    /// Fanout target; a node holds between `NODE_SIZE / 2` and `NODE_SIZE`
    /// entries. Must be at least 4.
    const NODE_SIZE: usize = 32;

    /// Strict total order on keys.
    fn less(&self, a: &Self::Key, b: &Self::Key) -> bool;

    /// Folds `v` into `acc`. Must be associative.
    fn aggregate(&self, acc: &mut Self::Value, v: &Self::Value);

    /// Serializes one entry.
    fn encode_entry<W: Write>(
        &self,
        writer: &mut W,
        key: &Self::Key,
        value: &Self::Value,
    ) -> Result<(), EncodeError>;

    /// Deserializes one entry.
    fn decode_entry<R: Read>(&self, reader: &mut R) -> Result<(Self::Key, Self::Value), DecodeError>;

    /// Smallest legal node size (root nodes may shrink below this).
    #[must_use]
    fn min_size() -> usize {
        Self::NODE_SIZE / 2
    }

    /// Largest legal node size.
    #[must_use]
    fn max_size() -> usize {
        (Self::NODE_SIZE / 2) * 2
    }
}

/// `u64 → u64` policy with natural key order and sum aggregation.
///
/// This is the policy used by the crate's doc examples; it turns the tree
/// into a persistent prefix-sum / order-statistic index over integers.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct U64SumPolicy;

impl Policy for U64SumPolicy {
    type Key = u64;
    type Value = u64;

    fn less(&self, a: &u64, b: &u64) -> bool {
        a < b
    }

    fn aggregate(&self, acc: &mut u64, v: &u64) {
        *acc += v;
    }

    fn encode_entry<W: Write>(&self, writer: &mut W, key: &u64, value: &u64) -> Result<(), EncodeError> {
        writer.write_u64_varint(*key)?;
        writer.write_u64_varint(*value)?;
        Ok(())
    }

    fn decode_entry<R: Read>(&self, reader: &mut R) -> Result<(u64, u64), DecodeError> {
        let key = reader.read_u64_varint()?;
        let value = reader.read_u64_varint()?;
        Ok((key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_sum_policy_roundtrip() -> crate::Result<()> {
        let policy = U64SumPolicy;

        let mut buf = vec![];
        policy.encode_entry(&mut buf, &300, &70_000).map_err(crate::Error::Encode)?;

        let (k, v) = policy
            .decode_entry(&mut &buf[..])
            .map_err(crate::Error::Decode)?;

        assert_eq!(300, k);
        assert_eq!(70_000, v);

        Ok(())
    }

    #[test]
    fn u64_sum_policy_sizes() {
        assert_eq!(16, U64SumPolicy::min_size());
        assert_eq!(32, U64SumPolicy::max_size());
    }
}
