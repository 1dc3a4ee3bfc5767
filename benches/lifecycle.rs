//! Lifecycle benchmarks
//!
//! - `transition/*`: state machine lookups
//! - `detach/*`: copying graphs out of a broker
//! - `attach/*`: merging detached copies back, including the version check
//! - `wire/*`: encoding detached graphs
//!
//! ## Running
//!
//! ```bash
//! cargo bench --bench lifecycle
//! cargo bench --bench lifecycle -- "detach"  # specific group
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use stead::lifecycle::{Transition, TransitionContext};
use stead::prelude::*;
use std::time::Duration;

// =============================================================================
// Fixtures - built outside timed loops
// =============================================================================

fn repository() -> Arc<MetaDataRepository> {
    let person = ClassMetaData::builder("Person")
        .field(FieldMetaData::new("id", TypeCode::Long).primary_key())
        .field(FieldMetaData::new("name", TypeCode::String))
        .field(FieldMetaData::new("age", TypeCode::Int))
        .field(FieldMetaData::new("version", TypeCode::Long).version())
        .field(
            FieldMetaData::relation("best_friend", "Person")
                .cascade(CascadeOp::Detach, CascadePolicy::Immediate)
                .cascade(CascadeOp::Attach, CascadePolicy::Immediate),
        )
        .application_identity()
        .build()
        .unwrap();
    Arc::new(MetaDataRepository::new().with(person))
}

/// Broker holding a committed chain of `len` people linked by best friend
fn chain(len: usize) -> (Broker, Oref) {
    let repo = repository();
    let meta = Arc::clone(repo.require("Person").unwrap());
    let factory = BrokerFactory::new(repo, Arc::new(InMemoryStore::new()), KernelConfig::default());
    let mut broker = factory.new_broker().unwrap();
    let head = broker
        .transaction(|b| {
            let mut prev: Option<Oref> = None;
            let mut head = None;
            for i in 0..len {
                let p = b.insert(
                    Record::new(Arc::clone(&meta))
                        .with("id", i as i64)
                        .with("name", format!("P{}", i).as_str())
                        .with("age", 30),
                );
                b.persist(p)?;
                match prev {
                    Some(prev) => b.set(prev, "best_friend", p)?,
                    None => head = Some(p),
                }
                prev = Some(p);
            }
            head.ok_or_else(|| SteadError::user("empty chain"))
        })
        .unwrap();
    (broker, head)
}

// =============================================================================
// Benchmarks
// =============================================================================

fn transition_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("transition");
    let ctx = TransitionContext {
        active: true,
        flushed: false,
    };
    let pairs = PCState::ALL.len() * Transition::ALL.len();
    group.throughput(Throughput::Elements(pairs as u64));
    group.bench_function("all_pairs", |b| {
        b.iter(|| {
            for state in PCState::ALL {
                for event in Transition::ALL {
                    let _ = black_box(state.transition(black_box(event), ctx));
                }
            }
        })
    });
    group.bench_function("optimistic_write", |b| {
        let event = Transition::write(true, true);
        b.iter(|| black_box(PCState::NonTransactional.transition(event, ctx)))
    });
    group.finish();
}

fn detach_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("detach");
    for len in [1usize, 16, 128] {
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("chain", len), &len, |b, &len| {
            b.iter_batched(
                || chain(len),
                |(mut broker, head)| black_box(broker.detach(head, None).unwrap()),
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn attach_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("attach");
    for len in [1usize, 16, 128] {
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("changed_chain", len), &len, |b, &len| {
            b.iter_batched(
                || {
                    let (mut broker, head) = chain(len);
                    let copy = broker.detach(head, None).unwrap();
                    broker.set(copy, "age", 31).unwrap();
                    (broker, copy)
                },
                |(mut broker, copy)| {
                    black_box(broker.transaction(|b| b.attach(copy, None)).unwrap())
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn wire_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire");
    let (mut broker, head) = chain(128);
    let copy = broker.detach(head, None).unwrap();
    let graph = broker.export_detached(&[copy]).unwrap();
    group.throughput(Throughput::Elements(graph.len() as u64));
    group.bench_function("msgpack_encode", |b| {
        b.iter(|| black_box(graph.to_bytes().unwrap()))
    });
    let bytes = graph.to_bytes().unwrap();
    group.bench_function("msgpack_decode", |b| {
        b.iter(|| black_box(DetachedGraph::from_bytes(&bytes).unwrap()))
    });
    group.finish();
}

criterion_group!(
    name = state_machine;
    config = Criterion::default().measurement_time(Duration::from_secs(5));
    targets = transition_benchmarks
);

criterion_group!(
    name = graphs;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(30);
    targets = detach_benchmarks, attach_benchmarks, wire_benchmarks
);

criterion_main!(state_machine, graphs);
