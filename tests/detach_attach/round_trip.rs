//! attach(detach(x)) behaves like x

use crate::common::*;

#[test]
fn test_unchanged_copy_round_trips_without_version_bump() {
    let mut b = broker();
    let p = committed_person(&mut b, 1, "Ann", 30);
    let before = b.version(p).unwrap();
    let copy = b.detach(p, None).unwrap();

    let managed = b.transaction(|b| b.attach(copy, None)).unwrap();
    assert_eq!(managed, p);
    assert_eq!(b.get(p, "name").unwrap(), FieldValue::from("Ann"));
    assert_eq!(b.get(p, "age").unwrap(), FieldValue::Int(30));
    assert_eq!(b.version(p).unwrap(), before);
}

#[test]
fn test_only_changed_field_is_merged() {
    let f = factory(KernelConfig::default());
    let mut b = f.new_broker().unwrap();
    let p = committed_person(&mut b, 1, "Ann", 30);
    let oid = b.object_id(p).unwrap().unwrap();

    let copy = b.detach(p, None).unwrap();
    b.set(copy, "age", 31).unwrap();
    let dirty = b.dirty(copy).unwrap();
    assert_eq!(dirty.iter().collect::<Vec<_>>(), vec![field_index("Person", "age")]);

    // a detached token travels to a second broker of the same factory
    let token = b.take(copy).unwrap();
    let mut other = f.new_broker().unwrap();
    let detached = other.insert_boxed(token);
    let managed = other.transaction(|o| o.attach(detached, None)).unwrap();
    assert_eq!(other.get(managed, "age").unwrap(), FieldValue::Int(31));
    assert_eq!(other.get(managed, "name").unwrap(), FieldValue::from("Ann"));
    assert_eq!(other.version(managed).unwrap(), Some(Version::Counter(2)));

    let mut reader = f.new_broker().unwrap();
    let fresh = reader.find(&oid).unwrap().unwrap();
    assert_eq!(reader.get(fresh, "age").unwrap(), FieldValue::Int(31));
}

#[test]
fn test_cycle_detaches_and_attaches_once_per_instance() {
    let mut b = broker();
    let (a, c) = committed_cycle(&mut b);
    let heap_before = b.heap_len();

    let copy_a = b.detach(a, None).unwrap();
    assert_eq!(b.heap_len(), heap_before + 2);
    let FieldValue::Ref(copy_c) = b.get(copy_a, "best_friend").unwrap() else {
        panic!("expected a reference");
    };
    assert_eq!(b.get(copy_c, "best_friend").unwrap(), FieldValue::Ref(copy_a));

    b.set(copy_c, "name", "Cy").unwrap();
    let managed = b.transaction(|b| b.attach(copy_a, None)).unwrap();
    assert_eq!(managed, a);
    assert_eq!(b.get(a, "best_friend").unwrap(), FieldValue::Ref(c));
    assert_eq!(b.get(c, "best_friend").unwrap(), FieldValue::Ref(a));
    assert_eq!(b.get(c, "name").unwrap(), FieldValue::from("Cy"));
}

#[test]
fn test_copy_detached_mid_transaction_keeps_pending_change() {
    let mut b = broker();
    let p = committed_person(&mut b, 1, "Ann", 30);
    b.begin().unwrap();
    b.set(p, "age", 99).unwrap();
    let copy = b.detach(p, None).unwrap();
    b.rollback().unwrap();

    let dirty = b.dirty(copy).unwrap();
    assert_eq!(dirty.iter().collect::<Vec<_>>(), vec![field_index("Person", "age")]);
    b.transaction(|b| b.attach(copy, None).map(|_| ())).unwrap();
    assert_eq!(b.get(p, "age").unwrap(), FieldValue::Int(99));
}

#[test]
fn test_detach_all_preserves_argument_order() {
    let mut b = broker();
    let orefs: Vec<Oref> = (1..=3)
        .map(|i| committed_person(&mut b, i, &format!("P{}", i), 20))
        .collect();
    let copies = b.detach_all(&orefs, None).unwrap().unwrap();
    assert_eq!(copies.len(), 3);
    for (i, copy) in copies.iter().enumerate() {
        assert!(b.is_detached(*copy).unwrap());
        assert_eq!(
            b.get(*copy, "name").unwrap(),
            FieldValue::from(format!("P{}", i + 1).as_str())
        );
    }
    let managed = b.transaction(|b| b.attach_all(&copies, None)).unwrap();
    assert_eq!(managed, orefs);
}

#[test]
fn test_detach_everything_empties_the_context() {
    let mut b = broker();
    let p = committed_person(&mut b, 1, "Ann", 30);
    b.detach_everything().unwrap();
    assert!(!b.is_managed(p));
    assert!(b.is_detached(p).unwrap());
    assert!(b.managed_objects().is_empty());

    b.set(p, "age", 35).unwrap();
    let managed = b.transaction(|b| b.attach(p, None)).unwrap();
    assert_eq!(b.get(managed, "age").unwrap(), FieldValue::Int(35));
    assert_eq!(b.state(managed).unwrap(), Some(PCState::NonTransactional));
}

#[test]
fn test_plain_instance_with_new_key_is_persisted_on_attach() {
    let mut b = broker();
    let plain = b.insert(person(7, "Neo", 20));
    let managed = b.transaction(|b| b.attach(plain, None)).unwrap();
    assert!(b.is_managed(managed));
    assert_eq!(b.version(managed).unwrap(), Some(Version::Counter(1)));
}
