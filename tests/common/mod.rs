// Not every test binary uses every helper
#![allow(dead_code)]

use agg_btree::{DecodeError, EncodeError, Policy};
use varint_rs::{VarintReader, VarintWriter};

/// `u64 → u64` sum policy with a tiny fanout, so even small key counts
/// produce several tree levels.
#[derive(Copy, Clone, Debug, Default)]
pub struct SmallSumPolicy;

impl Policy for SmallSumPolicy {
    type Key = u64;
    type Value = u64;

    const NODE_SIZE: usize = 8;

    fn less(&self, a: &u64, b: &u64) -> bool {
        a < b
    }

    fn aggregate(&self, acc: &mut u64, v: &u64) {
        *acc += v;
    }

    fn encode_entry<W: std::io::Write>(
        &self,
        writer: &mut W,
        key: &u64,
        value: &u64,
    ) -> Result<(), EncodeError> {
        writer.write_u64_varint(*key)?;
        writer.write_u64_varint(*value)?;
        Ok(())
    }

    fn decode_entry<R: std::io::Read>(&self, reader: &mut R) -> Result<(u64, u64), DecodeError> {
        let key = reader.read_u64_varint()?;
        let value = reader.read_u64_varint()?;
        Ok((key, value))
    }
}

/// Like [`SmallSumPolicy`], but aggregating with bitwise OR; the natural
/// fit for subset walks (`v & mask != 0` is monotone under OR).
#[derive(Copy, Clone, Debug, Default)]
pub struct SmallOrPolicy;

impl Policy for SmallOrPolicy {
    type Key = u64;
    type Value = u64;

    const NODE_SIZE: usize = 8;

    fn less(&self, a: &u64, b: &u64) -> bool {
        a < b
    }

    fn aggregate(&self, acc: &mut u64, v: &u64) {
        *acc |= v;
    }

    fn encode_entry<W: std::io::Write>(
        &self,
        writer: &mut W,
        key: &u64,
        value: &u64,
    ) -> Result<(), EncodeError> {
        SmallSumPolicy.encode_entry(writer, key, value)
    }

    fn decode_entry<R: std::io::Read>(&self, reader: &mut R) -> Result<(u64, u64), DecodeError> {
        SmallSumPolicy.decode_entry(reader)
    }
}

/// Collects a fallible entry iterator into a vec, panicking on I/O errors.
pub fn collect_pairs<I: Iterator<Item = agg_btree::Result<(u64, u64)>>>(iter: I) -> Vec<(u64, u64)> {
    iter.collect::<agg_btree::Result<Vec<_>>>()
        .expect("iteration should not fail")
}
