//! Stead - object lifecycle runtime for persistent object graphs
//!
//! Stead tracks the lifecycle of persistent instances inside a persistence
//! context, detaches graphs for use outside it, and merges changed copies
//! back with optimistic version checks.
//!
//! # Quick Start
//!
//! ```ignore
//! use stead::prelude::*;
//!
//! let factory = BrokerFactory::new(repository, Arc::new(InMemoryStore::new()), KernelConfig::default());
//! let mut broker = factory.new_broker()?;
//! let person = broker.transaction(|b| {
//!     let p = b.insert(Record::new(meta).with("id", 1i64).with("name", "Ann"));
//!     b.persist(p)?;
//!     Ok(p)
//! })?;
//!
//! let copy = broker.detach(person, None)?;
//! broker.set(copy, "name", "Anna")?;
//! broker.transaction(|b| b.attach(copy, None))?;
//! ```
//!
//! # Architecture
//!
//! - [`core`]: values, identities, versions, metadata and errors
//! - [`lifecycle`]: the `PCState` machine and state managers
//! - [`kernel`]: brokers, detach/attach, inverse management, factories
//! - [`query`]: value coercion, result packing and query statistics

pub use stead_core as core;
pub use stead_kernel as kernel;
pub use stead_lifecycle as lifecycle;
pub use stead_query as query;

/// Types most callers need
pub mod prelude {
    pub use stead_core::{
        CascadeOp, CascadePolicy, ClassMetaData, CollectionKind, FieldMetaData, FieldValue,
        MetaDataRepository, ObjectId, Oref, PersistenceCapable, Record, SteadError, SteadResult,
        TypeCode, Version,
    };
    pub use stead_kernel::{
        Broker, BrokerFactory, DetachedGraph, FactoryRegistry, InMemoryStore, KernelConfig,
    };
    pub use stead_lifecycle::PCState;
    pub use std::sync::Arc;
}
