//! Bidirectional relation upkeep

use crate::common::*;

fn managed(action: InverseAction) -> Broker {
    let mut config = KernelConfig::default();
    config.inverse.enabled = true;
    config.inverse.action = action;
    factory(config).new_broker().unwrap()
}

#[test]
fn test_owner_side_write_is_mirrored_and_committed() {
    let mut b = managed(InverseAction::Manage);
    let (d, p) = b
        .transaction(|b| {
            let d = b.insert(department("Research"));
            let p = b.insert(person(1, "Ann", 30));
            b.persist(d)?;
            b.persist(p)?;
            b.set(p, "dept", d)?;
            Ok((d, p))
        })
        .unwrap();
    assert!(b.get(d, "employees").unwrap().contains_ref(p));

    b.transaction(|b| b.set(p, "dept", FieldValue::Null)).unwrap();
    assert!(!b.get(d, "employees").unwrap().contains_ref(p));
}

#[test]
fn test_collection_replace_clears_removed_back_pointers() {
    let mut b = managed(InverseAction::Manage);
    b.transaction(|b| {
        let d = b.insert(department("Ops"));
        let p1 = b.insert(person(1, "A", 1));
        let p2 = b.insert(person(2, "B", 2));
        for o in [d, p1, p2] {
            b.persist(o)?;
        }
        b.set(d, "employees", FieldValue::list(vec![p1.into(), p2.into()]))?;
        b.set(d, "employees", FieldValue::list(vec![p2.into()]))?;
        assert_eq!(b.get(p1, "dept")?, FieldValue::Null);
        assert_eq!(b.get(p2, "dept")?, FieldValue::Ref(d));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_disabled_manager_leaves_other_side_alone() {
    let mut b = broker();
    b.transaction(|b| {
        let d = b.insert(department("Ops"));
        let p = b.insert(person(1, "A", 1));
        b.persist(d)?;
        b.persist(p)?;
        b.set(p, "dept", d)?;
        assert!(!b.get(d, "employees")?.contains_ref(p));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_exception_action_fails_the_transaction() {
    let mut b = managed(InverseAction::Exception);
    let err = b
        .transaction(|b| {
            let d = b.insert(department("Ops"));
            let p = b.insert(person(1, "A", 1));
            b.persist(d)?;
            b.persist(p)?;
            b.set(d, "employees", FieldValue::list(vec![p.into()]))
        })
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(!b.is_active());
}
