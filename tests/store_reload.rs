mod common;

use agg_btree::Config;
use common::{collect_pairs, SmallSumPolicy};
use rand::Rng;
use std::collections::BTreeMap;
use test_log::test;

#[test]
fn store_reload_empty() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let store = Config::new(folder.path(), SmallSumPolicy).open()?;
        let tree = store.attach("x");

        assert_eq!(0, tree.len());
        assert!(tree.is_empty());
        assert_eq!(None, tree.get(&5)?);

        store.sync()?;
    }

    {
        let store = Config::new(folder.path(), SmallSumPolicy).create(false).open()?;
        let tree = store.attach("x");

        assert_eq!(0, tree.len());
        assert!(tree.is_empty());
        assert_eq!(None, tree.get(&5)?);
    }

    Ok(())
}

#[test]
fn store_open_missing_without_create() {
    let folder = tempfile::tempdir().expect("should create tempdir");
    let path = folder.path().join("nope");

    assert!(Config::new(&path, SmallSumPolicy).create(false).open().is_err());
    assert!(Config::new(&path, SmallSumPolicy).open().is_ok());
}

#[test]
fn store_reload_smoke_test() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let store = Config::new(folder.path(), SmallSumPolicy).open()?;
        let tree = store.attach("kv");

        tree.set(&1, 100)?;
        tree.set(&2, 200)?;

        store.mark();
        store.sync()?;
    }

    {
        let store = Config::new(folder.path(), SmallSumPolicy).create(false).open()?;
        let tree = store.attach("kv");

        assert_eq!(2, tree.len());
        assert_eq!(Some(100), tree.get(&1)?);
        assert_eq!(Some(200), tree.get(&2)?);
        assert_eq!(Some(300), tree.total()?);
    }

    Ok(())
}

#[test]
fn store_reload_many_random_keys() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut reference = BTreeMap::<u64, u64>::new();
    let mut rng = rand::rng();

    {
        let store = Config::new(folder.path(), SmallSumPolicy)
            .max_unwritten(64)
            .max_lru(128)
            .open()?;
        let tree = store.attach("bulk");

        for _ in 0..10_000 {
            let key = rng.random_range(0..100_000u64);
            let value = rng.random_range(0..1_000u64);

            tree.set(&key, value)?;
            reference.insert(key, value);
        }

        store.mark();
        store.sync()?;
    }

    {
        let store = Config::new(folder.path(), SmallSumPolicy).create(false).open()?;
        let tree = store.attach("bulk");

        assert_eq!(reference.len() as u64, tree.len());

        let ours = collect_pairs(tree.iter());
        let theirs: Vec<(u64, u64)> = reference.iter().map(|(&k, &v)| (k, v)).collect();
        assert_eq!(theirs, ours);

        tree.snapshot().verify()?;
    }

    Ok(())
}

#[test]
fn sync_only_covers_the_last_mark() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let store = Config::new(folder.path(), SmallSumPolicy).open()?;
        let tree = store.attach("staged");

        tree.set(&1, 1)?;
        store.mark();

        // Mutated after the mark; must not become durable
        tree.set(&2, 2)?;

        store.sync()?;
    }

    {
        let store = Config::new(folder.path(), SmallSumPolicy).create(false).open()?;
        let tree = store.attach("staged");

        assert_eq!(Some(1), tree.get(&1)?);
        assert_eq!(None, tree.get(&2)?);
        assert_eq!(1, tree.len());
    }

    Ok(())
}
