mod common;

use agg_btree::Config;
use common::{collect_pairs, SmallOrPolicy};
use rand::Rng;
use test_log::test;

#[test]
fn subset_matches_naive_filter() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path(), SmallOrPolicy).open()?;
    let tree = store.attach("flags");

    let mut rng = rand::rng();

    for key in 0..1_000u64 {
        // Sparse bitmask values; the OR aggregate tells whole subtrees apart
        let value = 1u64 << rng.random_range(0..16u32);
        tree.set(&key, value)?;
    }

    let all = collect_pairs(tree.iter());

    for bit in 0..16u32 {
        let mask = 1u64 << bit;

        let expected: Vec<(u64, u64)> = all
            .iter()
            .copied()
            .filter(|&(_, v)| v & mask != 0)
            .collect();

        let walked = collect_pairs(tree.subset(move |v| v & mask != 0));

        assert_eq!(expected, walked, "bit {bit}");
    }

    Ok(())
}

#[test]
fn subset_skips_everything_on_false_predicate() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path(), SmallOrPolicy).open()?;
    let tree = store.attach("nothing");

    for key in 0..100u64 {
        tree.set(&key, 0b10)?;
    }

    assert!(collect_pairs(tree.subset(|v| v & 0b1 != 0)).is_empty());
    assert_eq!(100, collect_pairs(tree.subset(|v| v & 0b10 != 0)).len());

    // Empty tree yields nothing
    let empty = store.attach("empty");
    assert!(collect_pairs(empty.subset(|_| true)).is_empty());

    Ok(())
}
