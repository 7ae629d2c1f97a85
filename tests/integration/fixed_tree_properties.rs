#![allow(missing_docs)]

use std::collections::BTreeMap;

use proptest::prelude::*;
use voron::storage::FixedTreeShape;
use voron::{StorageEnvironment, StorageOptions};

#[derive(Debug, Clone)]
enum Op {
    Add(i64),
    Delete(i64),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    let key = prop_oneof![-50i64..50, -5_000i64..5_000, any::<i64>()];
    proptest::collection::vec(
        prop_oneof![3 => key.clone().prop_map(Op::Add), 1 => key.prop_map(Op::Delete)],
        1..900,
    )
}

fn open(dir: &std::path::Path) -> StorageEnvironment {
    StorageEnvironment::open(StorageOptions::new(dir).sync_journal(false).manual_flush(true)).unwrap()
}

fn value_for(key: i64) -> [u8; 8] {
    key.wrapping_mul(31).to_le_bytes()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn iteration_matches_model(ops in ops()) {
        let dir = tempfile::tempdir().unwrap();
        let env = open(dir.path());
        let mut model = BTreeMap::new();
        let mut tx = env.write_transaction().unwrap();
        {
            let mut tree = tx.fixed_tree_for("ordered", 8).unwrap();
            for op in &ops {
                match op {
                    Op::Add(key) => {
                        let inserted = tree.add(*key, &value_for(*key)).unwrap();
                        prop_assert_eq!(inserted, model.insert(*key, value_for(*key)).is_none());
                    }
                    Op::Delete(key) => {
                        let removed = tree.delete(*key).unwrap();
                        prop_assert_eq!(removed, model.remove(key).is_some());
                    }
                }
            }
            prop_assert_eq!(tree.number_of_entries().unwrap(), model.len() as u64);
        }
        tx.commit().unwrap();

        let mut tx = env.read_transaction().unwrap();
        let mut tree = tx.fixed_tree_for("ordered", 8).unwrap();
        let mut iter = tree.iter().unwrap();
        let mut seen = Vec::new();
        let mut more = iter.seek(i64::MIN).unwrap();
        while more {
            seen.push((iter.current_key().unwrap(), iter.value().unwrap()));
            more = iter.move_next().unwrap();
        }
        let expected: Vec<(i64, Vec<u8>)> = model.iter().map(|(k, v)| (*k, v.to_vec())).collect();
        prop_assert_eq!(seen, expected);
    }

    #[test]
    fn seek_lands_on_first_key_not_below(
        keys in proptest::collection::btree_set(-10_000i64..10_000, 0..700),
        probes in proptest::collection::vec(-10_100i64..10_100, 1..40),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let env = open(dir.path());
        let mut tx = env.write_transaction().unwrap();
        let mut tree = tx.fixed_tree_for("seek", 4).unwrap();
        for key in &keys {
            tree.add(*key, &(*key as i32).to_le_bytes()).unwrap();
        }
        let mut iter = tree.iter().unwrap();
        for probe in probes {
            let expected = keys.range(probe..).next().copied();
            let found = iter.seek(probe).unwrap();
            prop_assert_eq!(found, expected.is_some());
            if let Some(key) = expected {
                prop_assert_eq!(iter.current_key().unwrap(), key);
            }
        }
    }

    #[test]
    fn backward_walk_mirrors_forward_walk(keys in proptest::collection::btree_set(any::<i64>(), 1..600)) {
        let dir = tempfile::tempdir().unwrap();
        let env = open(dir.path());
        let mut tx = env.write_transaction().unwrap();
        let mut tree = tx.fixed_tree_for("backward", 0).unwrap();
        for key in &keys {
            tree.add(*key, &[]).unwrap();
        }
        let mut iter = tree.iter().unwrap();
        let mut seen = Vec::new();
        let mut more = iter.seek_to_last().unwrap();
        while more {
            seen.push(iter.current_key().unwrap());
            more = iter.move_prev().unwrap();
        }
        let expected: Vec<i64> = keys.iter().rev().copied().collect();
        prop_assert_eq!(seen, expected);
    }
}

#[test]
fn seek_on_one_three_five() {
    let dir = tempfile::tempdir().unwrap();
    let env = open(dir.path());
    let mut tx = env.write_transaction().unwrap();
    let mut tree = tx.fixed_tree_for("odd", 8).unwrap();
    for key in [1i64, 3, 5] {
        tree.add(key, &value_for(key)).unwrap();
    }
    let mut iter = tree.iter().unwrap();
    assert!(iter.seek(3).unwrap());
    assert_eq!(iter.current_key().unwrap(), 3);
    assert!(iter.seek(4).unwrap());
    assert_eq!(iter.current_key().unwrap(), 5);
    assert!(!iter.seek(6).unwrap());
}

#[test]
fn delete_range_spans_pages() {
    let dir = tempfile::tempdir().unwrap();
    let env = open(dir.path());
    let mut tx = env.write_transaction().unwrap();
    let mut tree = tx.fixed_tree_for("ranged", 8).unwrap();
    for key in 0..3000i64 {
        tree.add(key, &value_for(key)).unwrap();
    }
    assert!(matches!(tree.shape().unwrap(), FixedTreeShape::Large { .. }));
    assert_eq!(tree.delete_range(100, 2899).unwrap(), 2800);
    assert_eq!(tree.number_of_entries().unwrap(), 200);
    assert!(tree.contains(99).unwrap());
    assert!(!tree.contains(100).unwrap());
    assert!(tree.contains(2900).unwrap());
    assert_eq!(tree.delete_range(10, 5).unwrap(), 0);
}

#[test]
fn root_tree_delete_while_iterating_visits_every_key() {
    let dir = tempfile::tempdir().unwrap();
    let env = open(dir.path());
    let mut tx = env.write_transaction().unwrap();
    let mut tree = tx.fixed_tree_for("drain", 8).unwrap();
    for key in 0..2000i64 {
        tree.add(key, &value_for(key)).unwrap();
    }
    let mut deleted = 0;
    {
        let mut iter = tree.iter().unwrap();
        let mut more = iter.seek(i64::MIN).unwrap();
        while more {
            let key = iter.current_key().unwrap();
            more = if key % 2 == 0 {
                deleted += 1;
                iter.delete_current_and_move_next().unwrap()
            } else {
                iter.move_next().unwrap()
            };
        }
    }
    assert_eq!(deleted, 1000);
    assert_eq!(tree.number_of_entries().unwrap(), 1000);
    assert!(!tree.contains(0).unwrap());
    assert!(tree.contains(1999).unwrap());
}

#[test]
fn migrated_tree_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let env = open(dir.path());
        let mut tx = env.write_transaction().unwrap();
        {
            let mut tree = tx.create_tree("owner").unwrap();
            let mut fixed = tree.fixed_tree_for(b"scores", 8).unwrap();
            for key in 0..1500i64 {
                fixed.add(key, &value_for(key)).unwrap();
            }
            assert!(matches!(fixed.shape().unwrap(), FixedTreeShape::Large { .. }));
        }
        tx.commit().unwrap();
        env.flush_log_to_data_file().unwrap();
    }
    let env = open(dir.path());
    let mut tx = env.read_transaction().unwrap();
    let mut owner = tx.read_tree("owner").unwrap().unwrap();
    let mut fixed = owner.fixed_tree_for(b"scores", 8).unwrap();
    assert_eq!(fixed.number_of_entries().unwrap(), 1500);
    assert_eq!(fixed.read(1234).unwrap(), Some(value_for(1234).to_vec()));
}
