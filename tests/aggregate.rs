mod common;

use agg_btree::Config;
use common::SmallSumPolicy;
use rand::Rng;
use test_log::test;

#[test]
fn insertion_collapse() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path(), SmallSumPolicy).open()?;
    let tree = store.attach("ramp");

    for key in 0..1_000u64 {
        tree.set(&key, key)?;
    }

    assert_eq!(Some(499_500), tree.range_total(&0, &1_000)?);
    assert_eq!(Some(499_500), tree.total()?);

    tree.snapshot().verify()?;

    for key in (0..1_000u64).rev() {
        assert!(tree.erase(&key)?);

        if key % 100 == 0 && key > 0 {
            tree.snapshot().verify()?;
        }
    }

    assert!(tree.is_empty());
    assert_eq!(0, tree.height());
    assert_eq!(None, tree.total()?);

    Ok(())
}

#[test]
fn range_total_matches_naive_fold() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path(), SmallSumPolicy).open()?;
    let tree = store.attach("ranges");

    let mut rng = rand::rng();
    let mut pairs = std::collections::BTreeMap::new();

    for _ in 0..500 {
        let key = rng.random_range(0..1_000u64);
        let value = rng.random_range(0..50u64);
        tree.set(&key, value)?;
        pairs.insert(key, value);
    }

    for _ in 0..100 {
        let lo = rng.random_range(0..1_000u64);
        let hi = rng.random_range(0..1_000u64);

        let naive: u64 = pairs.range(lo..hi).map(|(_, &v)| v).sum();
        let expected = if pairs.range(lo..hi).next().is_none() {
            None
        } else {
            Some(naive)
        };

        assert_eq!(expected, tree.range_total(&lo, &hi)?, "range [{lo}, {hi})");
    }

    Ok(())
}

#[test]
fn accumulate_until_stops_before_crossing() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path(), SmallSumPolicy).open()?;
    let tree = store.attach("ones");

    // Every value is 1, so the running sum counts elements
    for key in 0..100u64 {
        tree.set(&key, 1)?;
    }

    let mut cursor = tree.start()?;
    let end = tree.end()?;
    let mut acc = None;

    tree.accumulate_until(&mut cursor, &mut acc, &end, |acc| *acc > 42)?;

    // Stopped after exactly 42 elements, on the 43rd in-order key
    assert_eq!(Some(42), acc);
    assert_eq!(Some(&42), cursor.key()?);

    // Resuming with an always-false predicate folds the rest
    tree.accumulate_until(&mut cursor, &mut acc, &end, |_| false)?;
    assert_eq!(Some(100), acc);
    assert!(cursor.is_end());

    Ok(())
}

#[test]
fn accumulate_until_respects_end() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path(), SmallSumPolicy).open()?;
    let tree = store.attach("clipped");

    for key in 0..200u64 {
        tree.set(&key, key)?;
    }

    let mut cursor = tree.start()?;
    let end = tree.lower_bound(&50)?;
    let mut acc = None;

    tree.accumulate_until(&mut cursor, &mut acc, &end, |_| false)?;

    let expected: u64 = (0..50).sum();
    assert_eq!(Some(expected), acc);
    assert_eq!(Some(&50), cursor.key()?);

    Ok(())
}

#[test]
fn accumulate_until_threshold_mid_tree() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path(), SmallSumPolicy).open()?;
    let tree = store.attach("prefix-sums");

    for key in 0..1_000u64 {
        tree.set(&key, key)?;
    }

    // For every threshold, the walk must stop exactly where the naive
    // prefix sum crosses it
    let mut rng = rand::rng();

    for _ in 0..50 {
        let threshold = rng.random_range(1..400_000u64);

        let mut cursor = tree.start()?;
        let end = tree.end()?;
        let mut acc = None;

        tree.accumulate_until(&mut cursor, &mut acc, &end, |acc| *acc >= threshold)?;

        let mut naive = 0u64;
        let mut stop_key = None;

        for key in 0..1_000u64 {
            if naive + key >= threshold {
                stop_key = Some(key);
                break;
            }
            naive += key;
        }

        match stop_key {
            Some(key) => {
                assert_eq!(Some(&key), cursor.key()?, "threshold {threshold}");
                assert_eq!(naive, acc.unwrap_or(0), "threshold {threshold}");
            }
            None => assert!(cursor.is_end(), "threshold {threshold}"),
        }
    }

    Ok(())
}
