mod common;

use agg_btree::Config;
use common::{collect_pairs, SmallSumPolicy};
use rand::Rng;
use std::collections::BTreeMap;
use test_log::test;

#[test]
fn tree_matches_reference_map() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path(), SmallSumPolicy)
        .max_unwritten(16)
        .max_lru(32)
        .slab_goal_size(64 * 1_024)
        .open()?;

    let tree = store.attach("numbers");
    let mut reference = BTreeMap::<u64, u64>::new();

    let mut rng = rand::rng();

    for step in 0usize..2_000 {
        let key = rng.random_range(0..500u64);

        match rng.random_range(0..4u32) {
            0..=1 => {
                let value = rng.random_range(0..100u64);
                tree.set(&key, value)?;
                reference.insert(key, value);
            }
            2 => {
                let value = rng.random_range(0..100u64);
                let inserted = tree.insert_if_absent(&key, value)?;
                assert_eq!(inserted, !reference.contains_key(&key));
                reference.entry(key).or_insert(value);
            }
            _ => {
                let erased = tree.erase(&key)?;
                assert_eq!(erased, reference.remove(&key).is_some());
            }
        }

        assert_eq!(reference.len() as u64, tree.len());
        assert_eq!(reference.is_empty(), tree.is_empty());

        if step % 250 == 0 {
            let ours = collect_pairs(tree.iter());
            let theirs: Vec<(u64, u64)> = reference.iter().map(|(&k, &v)| (k, v)).collect();
            assert_eq!(theirs, ours);

            tree.snapshot().verify()?;
        }
    }

    // Final state: full iteration, point reads, aggregate
    let ours = collect_pairs(tree.iter());
    let theirs: Vec<(u64, u64)> = reference.iter().map(|(&k, &v)| (k, v)).collect();
    assert_eq!(theirs, ours);

    for key in 0..500u64 {
        assert_eq!(reference.get(&key).copied(), tree.get(&key)?);
        assert_eq!(reference.contains_key(&key), tree.contains_key(&key)?);
    }

    let expected_total: u64 = reference.values().sum();
    match tree.total()? {
        Some(total) => assert_eq!(expected_total, total),
        None => assert!(reference.is_empty()),
    }

    tree.snapshot().verify()?;

    Ok(())
}

#[test]
fn update_with_subsumes_all_mutations() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path(), SmallSumPolicy).open()?;
    let tree = store.attach("generalized");

    // Insert through the generalized updater
    assert!(tree.update_with(&1, |current| {
        assert!(current.is_none());
        Some(10)
    })?);

    // Modify
    assert!(tree.update_with(&1, |current| current.map(|v| v + 5))?);
    assert_eq!(Some(15), tree.get(&1)?);

    // No-op: absent key, updater declines
    assert!(!tree.update_with(&2, |_| None)?);
    assert_eq!(1, tree.len());

    // Erase
    assert!(tree.update_with(&1, |_| None)?);
    assert!(tree.is_empty());
    assert_eq!(0, tree.height());

    Ok(())
}

#[test]
fn iteration_is_bidirectional() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path(), SmallSumPolicy).open()?;
    let tree = store.attach("walk");

    for key in (0..100u64).rev() {
        tree.set(&key, key)?;
    }

    // Forward
    let mut cursor = tree.start()?;
    for expected in 0..100u64 {
        assert_eq!(Some(&expected), cursor.key()?);
        cursor.advance()?;
    }
    assert!(cursor.is_end());

    // Backward from the end
    for expected in (0..100u64).rev() {
        cursor.retreat()?;
        assert_eq!(Some(&expected), cursor.key()?);
    }

    // Stepping back off the first entry is a no-op
    cursor.retreat()?;
    assert_eq!(Some(&0), cursor.key()?);

    Ok(())
}

#[test]
fn bounds_and_find() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path(), SmallSumPolicy).open()?;
    let tree = store.attach("bounds");

    for key in [10u64, 20, 30, 40, 50] {
        tree.set(&key, 1)?;
    }

    assert_eq!(Some(&20), tree.lower_bound(&15)?.key()?);
    assert_eq!(Some(&20), tree.lower_bound(&20)?.key()?);
    assert_eq!(Some(&30), tree.upper_bound(&20)?.key()?);
    assert_eq!(Some(&10), tree.lower_bound(&5)?.key()?);
    assert!(tree.lower_bound(&55)?.is_end());

    assert_eq!(Some(&30), tree.find(&30)?.key()?);
    assert!(tree.find(&31)?.is_end());

    Ok(())
}
