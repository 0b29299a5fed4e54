//! Property-based tests for `PersistentTreeMap`.
//!
//! Verifies the map laws under proptest, including a model-based comparison
//! against `std::collections::BTreeMap` that validates the red-black
//! invariants after every single operation.

use std::collections::BTreeMap;

use persimap::PersistentTreeMap;
use proptest::prelude::*;

// =============================================================================
// Strategies for Generating Test Data
// =============================================================================

/// Strategy for generating a `PersistentTreeMap` from a vector of key-value
/// pairs.
fn arbitrary_treemap(max_size: usize) -> impl Strategy<Value = PersistentTreeMap<i32, i32>> {
    prop::collection::vec((any::<i32>(), any::<i32>()), 0..max_size)
        .prop_map(|entries| entries.into_iter().collect::<PersistentTreeMap<i32, i32>>())
}

/// A single step of the model-based run. Small key space so inserts and
/// erases collide often.
#[derive(Clone, Debug)]
enum Operation {
    Insert(i8, i32),
    Erase(i8),
}

fn arbitrary_operations(max_length: usize) -> impl Strategy<Value = Vec<Operation>> {
    prop::collection::vec(
        prop_oneof![
            (any::<i8>(), any::<i32>()).prop_map(|(key, value)| Operation::Insert(key, value)),
            any::<i8>().prop_map(Operation::Erase),
        ],
        0..max_length,
    )
}

// =============================================================================
// Get-Insert Laws
// =============================================================================

proptest! {
    /// Law: get after insert returns the inserted value.
    /// map.insert(key, value).get(&key) == Some(&value)
    #[test]
    fn prop_get_insert_law(map in arbitrary_treemap(20), key: i32, value: i32) {
        let updated = map.insert(key, value);
        prop_assert_eq!(updated.get(&key), Some(&value));
    }

    /// Law: insert does not affect other keys.
    /// key1 != key2 => map.insert(key1, value).get(&key2) == map.get(&key2)
    #[test]
    fn prop_get_insert_other_law(
        map in arbitrary_treemap(20),
        key1: i32,
        key2: i32,
        value: i32
    ) {
        prop_assume!(key1 != key2);
        let updated = map.insert(key1, value);
        prop_assert_eq!(updated.get(&key2), map.get(&key2));
    }

    /// Law: inserting a present key does not change the size.
    #[test]
    fn prop_insert_upsert_size_law(map in arbitrary_treemap(20), key: i32, value: i32) {
        let expected = if map.contains(&key) { map.len() } else { map.len() + 1 };
        prop_assert_eq!(map.insert(key, value).len(), expected);
    }
}

// =============================================================================
// Erase Laws
// =============================================================================

proptest! {
    /// Law: get after erase returns None.
    /// map.erase(&key).get(&key) == None
    #[test]
    fn prop_get_erase_law(map in arbitrary_treemap(20), key: i32) {
        let removed = map.erase(&key);
        prop_assert_eq!(removed.get(&key), None);
    }

    /// Law: erase does not affect other keys.
    /// key1 != key2 => map.erase(&key1).get(&key2) == map.get(&key2)
    #[test]
    fn prop_get_erase_other_law(map in arbitrary_treemap(20), key1: i32, key2: i32) {
        prop_assume!(key1 != key2);
        let removed = map.erase(&key1);
        prop_assert_eq!(removed.get(&key2), map.get(&key2));
    }

    /// Law: erasing an absent key is a no-op.
    #[test]
    fn prop_erase_absent_identity_law(map in arbitrary_treemap(20), key: i32) {
        prop_assume!(!map.contains(&key));
        prop_assert_eq!(map.erase(&key), map);
    }

    /// Law: erase after inserting a fresh key restores the original content.
    #[test]
    fn prop_insert_erase_round_trip_law(map in arbitrary_treemap(20), key: i32, value: i32) {
        prop_assume!(!map.contains(&key));
        prop_assert_eq!(map.insert(key, value).erase(&key), map);
    }
}

// =============================================================================
// Persistence Laws
// =============================================================================

proptest! {
    /// Law: mutating operations never change the receiver.
    #[test]
    fn prop_persistence_law(map in arbitrary_treemap(20), key: i32, value: i32) {
        let snapshot: Vec<(i32, i32)> = map.iter().map(|(k, v)| (*k, *v)).collect();
        let _inserted = map.insert(key, value);
        let _removed = map.erase(&key);
        let after: Vec<(i32, i32)> = map.iter().map(|(k, v)| (*k, *v)).collect();
        prop_assert_eq!(snapshot, after);
    }
}

// =============================================================================
// Ordering and Invariant Laws
// =============================================================================

proptest! {
    /// Law: iteration yields keys in strictly ascending order.
    #[test]
    fn prop_iteration_ordered_law(map in arbitrary_treemap(50)) {
        let keys: Vec<i32> = map.keys().copied().collect();
        prop_assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
        prop_assert_eq!(keys.len(), map.len());
    }

    /// Law: the red-black invariants hold for any insertion order.
    #[test]
    fn prop_invariants_hold_law(map in arbitrary_treemap(100)) {
        prop_assert_eq!(map.validate(), Ok(()));
    }
}

// =============================================================================
// Model-Based Comparison with BTreeMap
// =============================================================================

proptest! {
    /// Runs an arbitrary operation sequence against both the persistent map
    /// and a mutable BTreeMap model, checking size, membership and the
    /// structural invariants after every step.
    #[test]
    fn prop_model_based_equivalence(operations in arbitrary_operations(64)) {
        let mut model: BTreeMap<i8, i32> = BTreeMap::new();
        let mut map: PersistentTreeMap<i8, i32> = PersistentTreeMap::new();

        for operation in &operations {
            match *operation {
                Operation::Insert(key, value) => {
                    model.insert(key, value);
                    map = map.insert(key, value);
                }
                Operation::Erase(key) => {
                    model.remove(&key);
                    map = map.erase(&key);
                }
            }
            prop_assert_eq!(map.validate(), Ok(()));
            prop_assert_eq!(map.len(), model.len());
        }

        let map_entries: Vec<(i8, i32)> = map.iter().map(|(k, v)| (*k, *v)).collect();
        let model_entries: Vec<(i8, i32)> = model.into_iter().collect();
        prop_assert_eq!(map_entries, model_entries);
    }

    /// Every intermediate version produced during a run stays intact after
    /// later operations.
    #[test]
    fn prop_version_history_law(operations in arbitrary_operations(32)) {
        let mut map: PersistentTreeMap<i8, i32> = PersistentTreeMap::new();
        let mut history: Vec<(PersistentTreeMap<i8, i32>, Vec<(i8, i32)>)> = Vec::new();

        for operation in &operations {
            map = match *operation {
                Operation::Insert(key, value) => map.insert(key, value),
                Operation::Erase(key) => map.erase(&key),
            };
            let snapshot: Vec<(i8, i32)> = map.iter().map(|(k, v)| (*k, *v)).collect();
            history.push((map.clone(), snapshot));
        }

        for (version, snapshot) in &history {
            let current: Vec<(i8, i32)> = version.iter().map(|(k, v)| (*k, *v)).collect();
            prop_assert_eq!(&current, snapshot);
            prop_assert_eq!(version.validate(), Ok(()));
        }
    }
}
