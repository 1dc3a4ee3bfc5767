//! Persistent class metadata
//!
//! The lifecycle core consults metadata but never owns its definition.
//! Classes are described once with [`ClassMetaData::builder`] and shared
//! behind `Arc` by every instance of the class.

mod class;
mod field;
mod types;

pub use class::{ClassMetaData, ClassMetaDataBuilder, MetaDataRepository};
pub use field::{FieldConverter, FieldMetaData, ValueMetaData};
pub use types::{
    CascadeOp, CascadePolicy, Cascades, DetachedStateMode, IdentityType, Management, TypeCode,
};
