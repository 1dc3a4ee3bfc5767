//! Loaded/dirty bitset discipline

use crate::common::*;
use proptest::prelude::*;
use stead::core::FieldSet;

proptest! {
    #[test]
    fn test_bits_stay_within_length(
        len in 1usize..200,
        indices in prop::collection::vec(0usize..400, 0..64),
    ) {
        let set = FieldSet::from_indices(len, indices.iter().copied().filter(|i| *i < len));
        prop_assert_eq!(set.len(), len);
        prop_assert!(set.iter().all(|i| i < len));
        if let Some(max) = set.max_index() {
            prop_assert!(max < len);
        }
        let collected: Vec<usize> = set.iter().collect();
        let mut sorted = collected.clone();
        sorted.sort_unstable();
        sorted.dedup();
        prop_assert_eq!(collected, sorted);
    }

    #[test]
    fn test_difference_is_subset(
        a in prop::collection::vec(0usize..64, 0..32),
        b in prop::collection::vec(0usize..64, 0..32),
    ) {
        let mut left = FieldSet::from_indices(64, a);
        let right = FieldSet::from_indices(64, b);
        let original = left.clone();
        left.difference_with(&right);
        prop_assert!(left.is_subset(&original));
        prop_assert!(left.iter().all(|i| !right.contains(i)));
    }
}

#[test]
fn test_attached_new_instance_is_loaded_before_dirty() {
    let mut b = broker();
    let count = repository().require("Person").unwrap().field_count();
    let managed = b
        .transaction(|b| {
            let p = b.insert(person(5, "Eve", 41));
            b.attach(p, None)
        })
        .unwrap();
    let loaded = b.loaded(managed).unwrap();
    let dirty = b.dirty(managed).unwrap();
    assert!(dirty.is_subset(&loaded));
    assert!(loaded.max_index().map_or(true, |m| m < count));
    assert_eq!(b.get(managed, "name").unwrap(), FieldValue::from("Eve"));
}

#[test]
fn test_dirty_tracks_writes_only() {
    let mut b = broker();
    let p = committed_person(&mut b, 1, "Ann", 30);
    b.transaction(|b| {
        b.set(p, "age", 31)?;
        let dirty = b.dirty(p)?;
        assert_eq!(dirty.iter().collect::<Vec<_>>(), vec![field_index("Person", "age")]);
        assert!(dirty.is_subset(&b.loaded(p)?));
        Ok(())
    })
    .unwrap();
}
