//! Shared test utilities for all integration test suites.
//!
//! Domain model: `Person` (application identity, versioned) with a
//! department, a best friend (detach/attach cascade), a friends list and an
//! embedded `Address`; `Department.employees` is mapped by `Person.dept`.
//! Import via `mod common;` from any test's main.rs.

#![allow(dead_code)]
#![allow(unused_imports)]

pub use stead::prelude::*;
pub use stead::kernel::{EventKind, InverseAction, LifecycleEvent, StoreManager};

use std::sync::Once;

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Route `tracing` output to the test harness
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

// ============================================================================
// Model
// ============================================================================

pub fn repository() -> Arc<MetaDataRepository> {
    let address = ClassMetaData::builder("Address")
        .field(FieldMetaData::new("street", TypeCode::String))
        .field(FieldMetaData::new("city", TypeCode::String))
        .embedded_only()
        .build()
        .unwrap();
    let person = ClassMetaData::builder("Person")
        .field(FieldMetaData::new("id", TypeCode::Long).primary_key())
        .field(FieldMetaData::new("name", TypeCode::String))
        .field(FieldMetaData::new("age", TypeCode::Int))
        .field(FieldMetaData::new("version", TypeCode::Long).version())
        .field(FieldMetaData::relation("dept", "Department").inverse("employees"))
        .field(
            FieldMetaData::relation("best_friend", "Person")
                .cascade(CascadeOp::Detach, CascadePolicy::Immediate)
                .cascade(CascadeOp::Attach, CascadePolicy::Immediate),
        )
        .field(
            FieldMetaData::collection_of("friends", "Person", CollectionKind::List)
                .cascade(CascadeOp::Persist, CascadePolicy::Auto),
        )
        .field(FieldMetaData::relation("address", "Address").embedded())
        .application_identity()
        .build()
        .unwrap();
    let department = ClassMetaData::builder("Department")
        .field(FieldMetaData::new("name", TypeCode::String))
        .field(
            FieldMetaData::collection_of("employees", "Person", CollectionKind::Set)
                .mapped_by("dept"),
        )
        .build()
        .unwrap();
    Arc::new(
        MetaDataRepository::new()
            .with(person)
            .with(department)
            .with(address),
    )
}

pub fn person(id: i64, name: &str, age: i32) -> Record {
    let meta = Arc::clone(repository().require("Person").unwrap());
    Record::new(meta)
        .with("id", id)
        .with("name", name)
        .with("age", age)
}

pub fn department(name: &str) -> Record {
    let meta = Arc::clone(repository().require("Department").unwrap());
    Record::new(meta).with("name", name)
}

pub fn address(street: &str, city: &str) -> Record {
    let meta = Arc::clone(repository().require("Address").unwrap());
    Record::new(meta).with("street", street).with("city", city)
}

pub fn field_index(class: &str, field: &str) -> usize {
    repository().require(class).unwrap().index_of(field).unwrap()
}

// ============================================================================
// Contexts
// ============================================================================

pub fn factory(config: KernelConfig) -> BrokerFactory {
    init_tracing();
    BrokerFactory::new(repository(), Arc::new(InMemoryStore::new()), config)
}

pub fn broker() -> Broker {
    factory(KernelConfig::default()).new_broker().unwrap()
}

/// Commit a new person and return its handle
pub fn committed_person(b: &mut Broker, id: i64, name: &str, age: i32) -> Oref {
    b.transaction(|b| {
        let p = b.insert(person(id, name, age));
        b.persist(p)?;
        Ok(p)
    })
    .unwrap()
}

/// Commit two people who are each other's best friend
pub fn committed_cycle(b: &mut Broker) -> (Oref, Oref) {
    b.transaction(|b| {
        let a = b.insert(person(1, "A", 1));
        let c = b.insert(person(2, "C", 2));
        b.persist(a)?;
        b.persist(c)?;
        b.set(a, "best_friend", c)?;
        b.set(c, "best_friend", a)?;
        Ok((a, c))
    })
    .unwrap()
}
