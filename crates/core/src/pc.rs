//! Persistence-capable instances
//!
//! [`PersistenceCapable`] is the compile-time accessor table a domain type
//! exposes to the runtime: read or write field `i` as a [`FieldValue`],
//! create a blank instance of the same class, and carry a detached-state
//! token. Hand-written domain structs implement it directly; [`Record`] is a
//! generic implementation driven purely by metadata.

use crate::field_set::FieldSet;
use crate::meta::ClassMetaData;
use crate::types::ObjectId;
use crate::value::FieldValue;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Bookkeeping a detached instance carries so it can be merged later.
///
/// Stored in the instance itself, independent of any state manager, so it
/// survives serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetachedState {
    /// Identity at detach time
    pub oid: Option<ObjectId>,
    /// Version at detach time; `None` when the instance had none
    pub version: Option<Version>,
    /// Fields captured at detach time
    pub loaded: FieldSet,
    /// Fields changed but not yet stored, at detach time or since
    pub dirty: FieldSet,
    /// Whether the instance was an embedded value
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub embedded: bool,
}

/// Field accessor table of a persistent class
pub trait PersistenceCapable: fmt::Debug + Send + Sync {
    /// Metadata of the instance's class
    fn meta(&self) -> &Arc<ClassMetaData>;

    /// Current value of field `index`
    fn provide_field(&self, index: usize) -> FieldValue;

    /// Overwrite field `index`
    fn replace_field(&mut self, index: usize, value: FieldValue);

    /// Blank instance of the same class with every field at its default
    fn new_instance(&self) -> Box<dyn PersistenceCapable>;

    /// Detached-state token, if any
    fn detached_state(&self) -> Option<&DetachedState>;

    /// Replace the detached-state token
    fn set_detached_state(&mut self, state: Option<DetachedState>);

    /// Class name
    fn class_name(&self) -> &str {
        self.meta().name()
    }

    /// Copy every field into a fresh instance (shallow)
    fn copy_fields(&self) -> Box<dyn PersistenceCapable> {
        let mut copy = self.new_instance();
        for i in 0..self.meta().field_count() {
            copy.replace_field(i, self.provide_field(i));
        }
        copy
    }
}

/// Metadata-driven instance storing one [`FieldValue`] per field
#[derive(Clone)]
pub struct Record {
    meta: Arc<ClassMetaData>,
    values: Vec<FieldValue>,
    detached: Option<DetachedState>,
}

impl Record {
    /// Instance with every field at its type default
    pub fn new(meta: Arc<ClassMetaData>) -> Self {
        let values = meta.fields().iter().map(|f| f.default_value()).collect();
        Record {
            meta,
            values,
            detached: None,
        }
    }

    /// Builder-style field assignment by name; unknown names are ignored
    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        if let Some(idx) = self.meta.field_named(field).map(|f| f.index) {
            self.values[idx] = value.into();
        }
        self
    }

    /// Field value by name
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.meta
            .field_named(field)
            .and_then(|f| self.values.get(f.index))
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(self.meta.name());
        for (fmd, value) in self.meta.fields().iter().zip(self.values.iter()) {
            s.field(&fmd.name, value);
        }
        s.finish()
    }
}

impl PersistenceCapable for Record {
    fn meta(&self) -> &Arc<ClassMetaData> {
        &self.meta
    }

    fn provide_field(&self, index: usize) -> FieldValue {
        self.values.get(index).cloned().unwrap_or(FieldValue::Null)
    }

    fn replace_field(&mut self, index: usize, value: FieldValue) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = value;
        }
    }

    fn new_instance(&self) -> Box<dyn PersistenceCapable> {
        Box::new(Record::new(Arc::clone(&self.meta)))
    }

    fn detached_state(&self) -> Option<&DetachedState> {
        self.detached.as_ref()
    }

    fn set_detached_state(&mut self, state: Option<DetachedState>) {
        self.detached = state;
    }
}
