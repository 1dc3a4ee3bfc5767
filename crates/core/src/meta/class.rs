//! Class metadata and the metadata repository

use super::field::FieldMetaData;
use super::types::{DetachedStateMode, IdentityType};
use crate::error::{SteadError, SteadResult};
use crate::field_set::FieldSet;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Metadata of a persistent class
#[derive(Debug, Clone)]
pub struct ClassMetaData {
    name: String,
    fields: Vec<FieldMetaData>,
    identity: IdentityType,
    generated_pk: bool,
    detached_state: DetachedStateMode,
    embedded_only: bool,
}

impl ClassMetaData {
    /// Start building metadata for `name`
    pub fn builder(name: impl Into<String>) -> ClassMetaDataBuilder {
        ClassMetaDataBuilder {
            meta: ClassMetaData {
                name: name.into(),
                fields: Vec::new(),
                identity: IdentityType::Datastore,
                generated_pk: false,
                detached_state: DetachedStateMode::Synthetic,
                embedded_only: false,
            },
        }
    }

    /// Class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields in declaration order
    pub fn fields(&self) -> &[FieldMetaData] {
        &self.fields
    }

    /// Number of fields
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Field by index
    pub fn field(&self, index: usize) -> Option<&FieldMetaData> {
        self.fields.get(index)
    }

    /// Field by index, as an error when absent
    pub fn require_field(&self, index: usize) -> SteadResult<&FieldMetaData> {
        self.fields.get(index).ok_or_else(|| {
            SteadError::internal(format!("{} has no field {}", self.name, index))
        })
    }

    /// Field by name
    pub fn field_named(&self, name: &str) -> Option<&FieldMetaData> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Index of the named field
    pub fn index_of(&self, name: &str) -> SteadResult<usize> {
        self.field_named(name)
            .map(|f| f.index)
            .ok_or_else(|| SteadError::user(format!("{} has no field named {}", self.name, name)))
    }

    /// Primary-key field indices in declaration order
    pub fn pk_fields(&self) -> impl Iterator<Item = usize> + '_ {
        self.fields.iter().filter(|f| f.primary_key).map(|f| f.index)
    }

    /// Version field, if any
    pub fn version_field(&self) -> Option<&FieldMetaData> {
        self.fields.iter().find(|f| f.version)
    }

    /// Identity scheme
    pub fn identity(&self) -> IdentityType {
        self.identity
    }

    /// Whether application keys are generated by the store
    pub fn generated_pk(&self) -> bool {
        self.generated_pk
    }

    /// Detached-state bookkeeping mode
    pub fn detached_state(&self) -> DetachedStateMode {
        self.detached_state
    }

    /// Whether instances only exist embedded in an owner
    pub fn embedded_only(&self) -> bool {
        self.embedded_only
    }

    /// Empty field set sized for this class
    pub fn field_set(&self) -> FieldSet {
        FieldSet::new(self.fields.len())
    }

    /// Field set of the primary-key fields
    pub fn pk_field_set(&self) -> FieldSet {
        FieldSet::from_indices(self.fields.len(), self.pk_fields())
    }
}

/// Builder for [`ClassMetaData`]
#[derive(Debug)]
pub struct ClassMetaDataBuilder {
    meta: ClassMetaData,
}

impl ClassMetaDataBuilder {
    /// Append a field; its index is its position
    pub fn field(mut self, mut field: FieldMetaData) -> Self {
        field.index = self.meta.fields.len();
        self.meta.fields.push(field);
        self
    }

    /// Use application identity
    pub fn application_identity(mut self) -> Self {
        self.meta.identity = IdentityType::Application;
        self
    }

    /// Let the store generate application keys
    pub fn generated_pk(mut self) -> Self {
        self.meta.generated_pk = true;
        self
    }

    /// Choose detached-state bookkeeping
    pub fn detached_state(mut self, mode: DetachedStateMode) -> Self {
        self.meta.detached_state = mode;
        self
    }

    /// Mark as embeddable-only
    pub fn embedded_only(mut self) -> Self {
        self.meta.embedded_only = true;
        self
    }

    /// Validate and finish
    pub fn build(self) -> SteadResult<Arc<ClassMetaData>> {
        let meta = self.meta;
        let mut seen = FxHashMap::default();
        for f in &meta.fields {
            if seen.insert(f.name.as_str(), f.index).is_some() {
                return Err(SteadError::Config(format!(
                    "{} declares field {} twice",
                    meta.name, f.name
                )));
            }
        }
        if meta.fields.iter().filter(|f| f.version).count() > 1 {
            return Err(SteadError::Config(format!(
                "{} declares more than one version field",
                meta.name
            )));
        }
        if meta.identity == IdentityType::Application && meta.pk_fields().next().is_none() {
            return Err(SteadError::Config(format!(
                "{} uses application identity without primary key fields",
                meta.name
            )));
        }
        Ok(Arc::new(meta))
    }
}

/// Metadata for every known class, keyed by name
#[derive(Debug, Clone, Default)]
pub struct MetaDataRepository {
    classes: FxHashMap<String, Arc<ClassMetaData>>,
}

impl MetaDataRepository {
    /// Empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a class
    pub fn register(&mut self, meta: Arc<ClassMetaData>) {
        self.classes.insert(meta.name().to_string(), meta);
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, meta: Arc<ClassMetaData>) -> Self {
        self.register(meta);
        self
    }

    /// Metadata by class name
    pub fn get(&self, class: &str) -> Option<&Arc<ClassMetaData>> {
        self.classes.get(class)
    }

    /// Metadata by class name, as a user error when unknown
    pub fn require(&self, class: &str) -> SteadResult<&Arc<ClassMetaData>> {
        self.get(class)
            .ok_or_else(|| SteadError::user(format!("no metadata for class {}", class)))
    }

    /// Number of registered classes
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether no class is registered
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
