//! Detached graphs crossing process boundaries

use crate::common::*;

#[test]
fn test_msgpack_graph_attaches_in_another_broker() {
    let f = factory(KernelConfig::default());
    let mut b = f.new_broker().unwrap();
    let p = committed_person(&mut b, 1, "Ann", 30);
    let oid = b.object_id(p).unwrap().unwrap();
    let copy = b.detach(p, None).unwrap();
    b.set(copy, "name", "Anna").unwrap();
    let bytes = b.export_detached(&[copy]).unwrap().to_bytes().unwrap();
    b.close().unwrap();

    let mut other = f.new_broker().unwrap();
    let roots = other
        .import_detached(DetachedGraph::from_bytes(&bytes).unwrap())
        .unwrap();
    assert_eq!(other.dirty(roots[0]).unwrap().count(), 1);
    other.transaction(|o| o.attach(roots[0], None)).unwrap();

    let mut reader = f.new_broker().unwrap();
    let fresh = reader.find(&oid).unwrap().unwrap();
    assert_eq!(reader.get(fresh, "name").unwrap(), FieldValue::from("Anna"));
}

#[test]
fn test_json_graph_keeps_shared_references() {
    let mut b = broker();
    let (a, _) = committed_cycle(&mut b);
    let copy = b.detach(a, None).unwrap();
    let graph = b.export_detached(&[copy]).unwrap();
    assert_eq!(graph.len(), 2);

    let json = graph.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["roots"], serde_json::json!([0]));

    let mut other = broker();
    let roots = other
        .import_detached(DetachedGraph::from_json(&json).unwrap())
        .unwrap();
    let FieldValue::Ref(c) = other.get(roots[0], "best_friend").unwrap() else {
        panic!("expected a reference");
    };
    assert_eq!(other.get(c, "best_friend").unwrap(), FieldValue::Ref(roots[0]));
}

#[test]
fn test_garbage_input_is_a_serialization_error() {
    assert!(matches!(
        DetachedGraph::from_json("{not json"),
        Err(SteadError::Serialization(_))
    ));
}
