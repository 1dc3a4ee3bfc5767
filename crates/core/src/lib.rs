//! Core types for the stead persistence runtime
//!
//! This crate defines the vocabulary shared by every layer:
//! - Error: the [`SteadError`] taxonomy and [`SteadResult`] alias
//! - Identity: [`Oref`] heap handles, [`ObjectId`] persistent ids
//! - Values: [`FieldValue`], the tagged value every field access passes
//! - Versions: opaque [`Version`] tokens and [`VersionOrdering`]
//! - Bitsets: [`FieldSet`] for loaded/dirty/flushed tracking
//! - Metadata: [`ClassMetaData`], [`FieldMetaData`], [`MetaDataRepository`]
//! - Instances: the [`PersistenceCapable`] accessor table and generic [`Record`]
//! - Traversal: [`VisitArena`] for cycle-safe graph walks

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod error;
pub mod field_set;
pub mod meta;
pub mod pc;
pub mod types;
pub mod value;
pub mod version;

pub use arena::VisitArena;
pub use error::{SteadError, SteadResult};
pub use field_set::FieldSet;
pub use meta::{
    CascadeOp, CascadePolicy, Cascades, ClassMetaData, ClassMetaDataBuilder, DetachedStateMode,
    FieldConverter, FieldMetaData, IdentityType, Management, MetaDataRepository, TypeCode,
    ValueMetaData,
};
pub use pc::{DetachedState, PersistenceCapable, Record};
pub use types::{FailedObject, IdKey, IdValue, ObjectId, Oref};
pub use value::{CollectionKind, FieldValue};
pub use version::{Version, VersionOrdering};
