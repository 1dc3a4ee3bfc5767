//! Factory sharing and registry lifetimes

use crate::common::*;

#[test]
fn test_brokers_of_one_factory_share_committed_state() {
    let f = factory(KernelConfig::default());
    let mut writer = f.new_broker().unwrap();
    let p = committed_person(&mut writer, 1, "Ann", 30);
    let oid = writer.object_id(p).unwrap().unwrap();

    let mut reader = f.new_broker().unwrap();
    let q = reader.find(&oid).unwrap().unwrap();
    assert_eq!(reader.get(q, "name").unwrap(), FieldValue::from("Ann"));
    assert_ne!(writer.id(), reader.id());
    assert_eq!(f.brokers_created(), 2);
}

#[test]
fn test_closing_a_factory_removes_it_from_its_registry() {
    let registry = FactoryRegistry::new();
    let f = factory(KernelConfig::default());
    registry.register("people", f.clone()).unwrap();
    assert!(registry.get("people").unwrap().same_as(&f));

    f.close().unwrap();
    assert!(registry.get("people").is_none());
    assert!(registry.is_empty());
    assert!(f.new_broker().is_err());
}

#[test]
fn test_registries_do_not_share_entries() {
    let first = FactoryRegistry::new();
    let second = FactoryRegistry::new();
    first.register("a", factory(KernelConfig::default())).unwrap();
    second.register("a", factory(KernelConfig::default())).unwrap();

    let a1 = first.get("a").unwrap();
    let a2 = second.get("a").unwrap();
    assert!(!a1.same_as(&a2));
    a1.close().unwrap();
    assert!(first.is_empty());
    assert_eq!(second.keys(), vec!["a".to_string()]);
}

#[test]
fn test_get_or_create_returns_the_existing_factory() {
    let registry = FactoryRegistry::new();
    let created = registry
        .get_or_create("main", || Ok(factory(KernelConfig::default())))
        .unwrap();
    let again = registry
        .get_or_create("main", || panic!("factory created twice"))
        .unwrap();
    assert!(created.same_as(&again));
    assert_eq!(registry.len(), 1);
}
