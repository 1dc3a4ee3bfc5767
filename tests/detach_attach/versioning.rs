//! Optimistic version checks on attach

use crate::common::*;

#[test]
fn test_stale_copy_is_rejected_and_not_applied() {
    let f = factory(KernelConfig::default());
    let mut b = f.new_broker().unwrap();
    let p = committed_person(&mut b, 1, "Ann", 30);
    let oid = b.object_id(p).unwrap().unwrap();
    let stale = b.detach(p, None).unwrap();

    let mut other = f.new_broker().unwrap();
    let q = other.find(&oid).unwrap().unwrap();
    other.transaction(|o| o.set(q, "age", 40)).unwrap();

    b.set(stale, "name", "Stale").unwrap();
    let token = b.take(stale).unwrap();
    let mut late = f.new_broker().unwrap();
    let detached = late.insert_boxed(token);
    let err = late
        .transaction(|l| l.attach(detached, None))
        .unwrap_err();
    assert!(err.is_optimistic());

    let mut reader = f.new_broker().unwrap();
    let fresh = reader.find(&oid).unwrap().unwrap();
    assert_eq!(reader.get(fresh, "name").unwrap(), FieldValue::from("Ann"));
    assert_eq!(reader.get(fresh, "age").unwrap(), FieldValue::Int(40));
    assert_eq!(reader.version(fresh).unwrap(), Some(Version::Counter(2)));
}

#[test]
fn test_deleted_row_fails_attach_of_versioned_copy() {
    let mut b = broker();
    let p = committed_person(&mut b, 1, "Ann", 30);
    let copy = b.detach(p, None).unwrap();
    b.transaction(|b| b.delete(p)).unwrap();
    let err = b.transaction(|b| b.attach(copy, None)).unwrap_err();
    assert!(err.is_optimistic());
}

#[test]
fn test_failed_attach_rolls_back_the_transaction() {
    let mut b = broker();
    let p = committed_person(&mut b, 1, "Ann", 30);
    let stale = b.detach(p, None).unwrap();
    b.transaction(|b| b.set(p, "age", 50)).unwrap();
    b.set(stale, "age", 1).unwrap();

    assert!(b.transaction(|b| b.attach(stale, None)).is_err());
    assert!(!b.is_active());
    assert_eq!(b.get(p, "age").unwrap(), FieldValue::Int(50));
}
