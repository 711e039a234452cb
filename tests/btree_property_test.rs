//! Model-based property tests for the B+Tree.
//!
//! Random operation sequences run against both the tree and a
//! `std::collections::BTreeMap` model; the two must always agree.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use stratadb::buffer::BufferPoolManager;
use stratadb::common::RecordId;
use stratadb::index::{BTree, DeletePolicy, Key, KeyType};
use stratadb::storage::DiskManager;
use tempfile::tempdir;

#[derive(Debug, Clone)]
enum Op {
    Insert(i32),
    Delete(i32),
    Search(i32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    // A small key space so operations collide often.
    let key = 0i32..512;
    prop_oneof![
        3 => key.clone().prop_map(Op::Insert),
        2 => key.clone().prop_map(Op::Delete),
        1 => key.prop_map(Op::Search),
    ]
}

fn rid_for(key: i32) -> RecordId {
    RecordId::new(key as u32, (key % 13) as u32)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        .. ProptestConfig::default()
    })]

    /// Keys are kept unique (inserts of a present key are skipped), so
    /// the map model is exact for searches, deletes, and full scans.
    #[test]
    fn test_tree_matches_map_model(
        ops in proptest::collection::vec(op_strategy(), 1..400),
        policy_full in any::<bool>(),
    ) {
        let dir = tempdir().unwrap();
        let dm = DiskManager::create(dir.path().join("test.db")).unwrap();
        let bpm = Arc::new(BufferPoolManager::new(32, dm));
        let policy = if policy_full { DeletePolicy::Full } else { DeletePolicy::Naive };
        let tree = BTree::create(bpm, "model", KeyType::Int, 16, policy).unwrap();

        let mut model: BTreeMap<i32, RecordId> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(k) => {
                    if !model.contains_key(&k) {
                        tree.insert(&Key::Int(k), rid_for(k)).unwrap();
                        model.insert(k, rid_for(k));
                    }
                }
                Op::Delete(k) => {
                    let deleted = tree.delete(&Key::Int(k), rid_for(k)).unwrap();
                    prop_assert_eq!(deleted, model.remove(&k).is_some());
                }
                Op::Search(k) => {
                    let found = tree.search(&Key::Int(k)).unwrap();
                    prop_assert_eq!(found, model.get(&k).copied());
                }
            }
        }

        // Final full scan agrees with the model in content and order.
        let mut scan = tree.scan(None, None).unwrap();
        let mut scanned = Vec::new();
        while let Some((key, rid)) = scan.next().unwrap() {
            let Key::Int(k) = key else { unreachable!() };
            scanned.push((k, rid));
        }
        let expected: Vec<(i32, RecordId)> =
            model.iter().map(|(&k, &r)| (k, r)).collect();
        prop_assert_eq!(scanned, expected);
        prop_assert_eq!(tree.is_empty().unwrap(), model.is_empty());
    }

    /// Range scans over random bounds return exactly the model's
    /// inclusive range.
    #[test]
    fn test_range_scan_matches_model(
        keys in proptest::collection::btree_set(0i32..1000, 0..300),
        lo in 0i32..1000,
        width in 0i32..500,
    ) {
        let dir = tempdir().unwrap();
        let dm = DiskManager::create(dir.path().join("test.db")).unwrap();
        let bpm = Arc::new(BufferPoolManager::new(32, dm));
        let tree = BTree::create(bpm, "ranges", KeyType::Int, 16, DeletePolicy::Naive).unwrap();

        for &k in &keys {
            tree.insert(&Key::Int(k), rid_for(k)).unwrap();
        }

        let hi = lo.saturating_add(width);
        let mut scan = tree.scan(Some(&Key::Int(lo)), Some(&Key::Int(hi))).unwrap();
        let mut scanned = Vec::new();
        while let Some((key, _)) = scan.next().unwrap() {
            let Key::Int(k) = key else { unreachable!() };
            scanned.push(k);
        }

        let expected: Vec<i32> = keys.range(lo..=hi).copied().collect();
        prop_assert_eq!(scanned, expected);
    }
}
