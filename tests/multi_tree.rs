mod common;

use agg_btree::Config;
use common::{collect_pairs, SmallSumPolicy};
use test_log::test;

#[test]
fn named_trees_are_independent() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path(), SmallSumPolicy).open()?;

    let names: Vec<String> = (0..4).map(|_| nanoid::nanoid!()).collect();

    for (i, name) in names.iter().enumerate() {
        let tree = store.attach(name);
        for key in 0..10u64 {
            tree.set(&key, (i as u64 + 1) * 100 + key)?;
        }
    }

    for (i, name) in names.iter().enumerate() {
        let tree = store.attach(name);
        assert_eq!(10, tree.len());
        assert_eq!(Some((i as u64 + 1) * 100 + 3), tree.get(&3)?);
    }

    assert_eq!(4, store.tree_names().len());

    Ok(())
}

#[test]
fn one_sync_commits_all_named_trees() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let store = Config::new(folder.path(), SmallSumPolicy).open()?;

        let a = store.attach("a");
        let b = store.attach("b");

        for key in 0..50u64 {
            a.set(&key, key)?;
            b.set(&key, key * 2)?;
        }

        store.mark();
        store.sync()?;

        // A second sync without a new mark is a no-op
        store.sync()?;
    }

    {
        let store = Config::new(folder.path(), SmallSumPolicy).create(false).open()?;

        let a = store.attach("a");
        let b = store.attach("b");

        assert_eq!(50, a.len());
        assert_eq!(50, b.len());
        assert_eq!(Some((0..50).sum()), a.total()?);
        assert_eq!(Some((0..50).map(|k| k * 2).sum()), b.total()?);

        assert_eq!(collect_pairs(a.iter()).len(), 50);
    }

    Ok(())
}

#[test]
fn attach_returns_the_same_tree() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path(), SmallSumPolicy).open()?;

    let first = store.attach("shared");
    let second = store.attach("shared");

    first.set(&1, 10)?;
    assert_eq!(Some(10), second.get(&1)?);

    second.erase(&1)?;
    assert!(first.is_empty());

    Ok(())
}

#[test]
fn revert_drops_trees_attached_after_the_mark() -> agg_btree::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path(), SmallSumPolicy).open()?;

    let keeper = store.attach("keeper");
    keeper.set(&1, 1)?;

    store.mark();

    let latecomer = store.attach("latecomer");
    latecomer.set(&9, 9)?;

    store.revert();

    assert_eq!(1, keeper.len());
    assert!(latecomer.is_empty());
    assert!(!store.tree_names().contains(&"latecomer".to_owned()));

    Ok(())
}
