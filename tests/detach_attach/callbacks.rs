//! Callback failure modes across multi-instance operations

use crate::common::*;
use parking_lot::Mutex;

fn refuse_second(b: &mut Broker, kind: EventKind, second: Oref) -> Arc<Mutex<Vec<Option<Oref>>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    b.add_listener_for(
        &[kind],
        Arc::new(move |e: &LifecycleEvent| {
            sink.lock().push(e.oref);
            if e.oref == Some(second) {
                return Err("refused".to_string());
            }
            Ok(())
        }),
    );
    seen
}

fn three_people(b: &mut Broker) -> Vec<Oref> {
    (1..=3)
        .map(|i| committed_person(b, i, &format!("P{}", i), 20))
        .collect()
}

#[test]
fn test_collect_mode_visits_all_then_reports() {
    let mut b = broker();
    let orefs = three_people(&mut b);
    let seen = refuse_second(&mut b, EventKind::BeforeDetach, orefs[1]);

    let err = b.detach_all(&orefs, None).unwrap_err();
    match err {
        SteadError::Nested { causes, .. } => assert_eq!(causes.len(), 1),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(seen.lock().len(), 3);
}

#[test]
fn test_fail_fast_stops_at_first_failure() {
    let mut config = KernelConfig::default();
    config.callbacks.fail_fast = true;
    let mut b = factory(config).new_broker().unwrap();
    let orefs = three_people(&mut b);
    let seen = refuse_second(&mut b, EventKind::BeforeDetach, orefs[1]);

    let err = b.detach_all(&orefs, None).unwrap_err();
    assert!(matches!(err, SteadError::Callback { .. }));
    assert_eq!(*seen.lock(), vec![Some(orefs[0]), Some(orefs[1])]);
}

#[test]
fn test_factory_listener_sees_attach_events() {
    let f = factory(KernelConfig::default());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    f.add_listener_for(
        &[EventKind::BeforeAttach, EventKind::AfterAttach],
        Arc::new(move |e: &LifecycleEvent| {
            sink.lock().push(e.kind);
            Ok(())
        }),
    )
    .unwrap();
    let mut b = f.new_broker().unwrap();
    let p = committed_person(&mut b, 1, "Ann", 30);
    let copy = b.detach(p, None).unwrap();
    b.transaction(|b| b.attach(copy, None)).unwrap();
    assert_eq!(
        *events.lock(),
        vec![EventKind::BeforeAttach, EventKind::AfterAttach]
    );
}
