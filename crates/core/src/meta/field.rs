//! Field and value metadata

use super::types::{CascadeOp, CascadePolicy, Cascades, Management, TypeCode};
use crate::error::SteadResult;
use crate::value::{CollectionKind, FieldValue};
use std::fmt;
use std::sync::Arc;

/// Converts between the in-memory field value and its stored form.
///
/// `externalize` runs on the way out (`fetch`), `factory` on the way in
/// (`store`).
pub trait FieldConverter: Send + Sync {
    /// Memory form to stored form
    fn externalize(&self, value: FieldValue) -> SteadResult<FieldValue>;
    /// Stored form to memory form
    fn factory(&self, value: FieldValue) -> SteadResult<FieldValue>;
}

/// Metadata of a field's value, or of a container's element/key
#[derive(Debug, Clone, PartialEq)]
pub struct ValueMetaData {
    /// Type category
    pub type_code: TypeCode,
    /// Related class for `Pc` values
    pub related_class: Option<String>,
    /// Per-operation cascade policies
    pub cascades: Cascades,
    /// Whether a related instance is embedded in its owner
    pub embedded: bool,
}

impl ValueMetaData {
    /// Value metadata of a plain type
    pub fn of(type_code: TypeCode) -> Self {
        ValueMetaData {
            type_code,
            related_class: None,
            cascades: Cascades::default(),
            embedded: false,
        }
    }

    /// Value metadata referencing a persistent class
    pub fn pc(class: impl Into<String>) -> Self {
        ValueMetaData {
            type_code: TypeCode::Pc,
            related_class: Some(class.into()),
            cascades: Cascades::default(),
            embedded: false,
        }
    }

    /// Whether values are embedded persistent instances
    pub fn is_embedded_pc(&self) -> bool {
        self.embedded && self.type_code.is_pc()
    }

    /// Effective cascade policy; embedded values always cascade
    /// detach and attach
    pub fn cascade(&self, op: CascadeOp) -> CascadePolicy {
        if self.is_embedded_pc() && matches!(op, CascadeOp::Detach | CascadeOp::Attach) {
            return CascadePolicy::Immediate;
        }
        self.cascades.get(op)
    }
}

/// Metadata of one persistent field
#[derive(Clone)]
pub struct FieldMetaData {
    /// Declared name
    pub name: String,
    /// Position in the class's field table
    pub index: usize,
    /// The field's own value
    pub value: ValueMetaData,
    /// Element metadata for collections and arrays, value metadata for maps
    pub element: ValueMetaData,
    /// Key metadata for maps
    pub key: ValueMetaData,
    /// List or set, for collections
    pub collection_kind: CollectionKind,
    /// Part of the primary key
    pub primary_key: bool,
    /// Holds the version token
    pub version: bool,
    /// Large result set; never iterated eagerly
    pub lrs: bool,
    /// Persistent, transactional or unmanaged
    pub management: Management,
    /// Loaded with the default fetch group
    pub default_fetch_group: bool,
    /// Named fetch groups this field belongs to
    pub fetch_groups: Vec<String>,
    /// Names of the fields on the related class that mirror this one
    pub inverses: Vec<String>,
    /// Owning-side field on the related class, when this side is mapped by it
    pub mapped_by: Option<String>,
    /// Optional externalizer/factory
    pub converter: Option<Arc<dyn FieldConverter>>,
    /// Whether `Object` values may be copied when detached
    pub copyable: bool,
}

impl fmt::Debug for FieldMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldMetaData")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("type_code", &self.value.type_code)
            .field("primary_key", &self.primary_key)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl FieldMetaData {
    /// Field of the given type; defaults mirror a simple basic mapping
    pub fn new(name: impl Into<String>, type_code: TypeCode) -> Self {
        let container = type_code.is_container();
        FieldMetaData {
            name: name.into(),
            index: 0,
            value: ValueMetaData::of(type_code),
            element: ValueMetaData::of(TypeCode::Object),
            key: ValueMetaData::of(TypeCode::Object),
            collection_kind: CollectionKind::List,
            primary_key: false,
            version: false,
            lrs: false,
            management: Management::Persistent,
            default_fetch_group: !container,
            fetch_groups: Vec::new(),
            inverses: Vec::new(),
            mapped_by: None,
            converter: None,
            copyable: true,
        }
    }

    /// To-one relation field
    pub fn relation(name: impl Into<String>, class: impl Into<String>) -> Self {
        let mut fmd = FieldMetaData::new(name, TypeCode::Pc);
        fmd.value = ValueMetaData::pc(class);
        fmd
    }

    /// To-many relation field held in a collection
    pub fn collection_of(
        name: impl Into<String>,
        class: impl Into<String>,
        kind: CollectionKind,
    ) -> Self {
        let mut fmd = FieldMetaData::new(name, TypeCode::Collection);
        fmd.element = ValueMetaData::pc(class);
        fmd.collection_kind = kind;
        fmd
    }

    /// Map field with the given key and value metadata
    pub fn map_of(name: impl Into<String>, key: ValueMetaData, value: ValueMetaData) -> Self {
        let mut fmd = FieldMetaData::new(name, TypeCode::Map);
        fmd.key = key;
        fmd.element = value;
        fmd
    }

    /// Array field with the given element metadata
    pub fn array_of(name: impl Into<String>, element: ValueMetaData) -> Self {
        let mut fmd = FieldMetaData::new(name, TypeCode::Array);
        fmd.element = element;
        fmd
    }

    // =========================================================================
    // Builder
    // =========================================================================

    /// Mark as primary key
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.default_fetch_group = true;
        self
    }

    /// Mark as version field
    pub fn version(mut self) -> Self {
        self.version = true;
        self
    }

    /// Mark as large result set
    pub fn lrs(mut self) -> Self {
        self.lrs = true;
        self.default_fetch_group = false;
        self
    }

    /// Mark as embedded
    pub fn embedded(mut self) -> Self {
        self.value.embedded = true;
        self
    }

    /// Set the cascade policy for an operation on the field and its elements
    pub fn cascade(mut self, op: CascadeOp, policy: CascadePolicy) -> Self {
        self.value.cascades.set(op, policy);
        self.element.cascades.set(op, policy);
        self.key.cascades.set(op, policy);
        self
    }

    /// Same cascade policy for every operation
    pub fn cascade_all(mut self, policy: CascadePolicy) -> Self {
        self.value.cascades = Cascades::all(policy);
        self.element.cascades = Cascades::all(policy);
        self.key.cascades = Cascades::all(policy);
        self
    }

    /// Declare an inverse field on the related class
    pub fn inverse(mut self, field: impl Into<String>) -> Self {
        self.inverses.push(field.into());
        self
    }

    /// Declare this side as mapped by `field` on the related class
    pub fn mapped_by(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        if !self.inverses.contains(&field) {
            self.inverses.push(field.clone());
        }
        self.mapped_by = Some(field);
        self
    }

    /// Add to a named fetch group
    pub fn in_fetch_group(mut self, group: impl Into<String>) -> Self {
        self.fetch_groups.push(group.into());
        self
    }

    /// Override default-fetch-group membership
    pub fn default_fetch_group(mut self, dfg: bool) -> Self {
        self.default_fetch_group = dfg;
        self
    }

    /// Set management
    pub fn management(mut self, management: Management) -> Self {
        self.management = management;
        self
    }

    /// Install an externalizer/factory
    pub fn converter(mut self, converter: Arc<dyn FieldConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Forbid copying `Object` values on detach
    pub fn not_copyable(mut self) -> Self {
        self.copyable = false;
        self
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Type code of the field itself
    pub fn type_code(&self) -> TypeCode {
        self.value.type_code
    }

    /// Whether the field or its elements reference persistent instances
    pub fn is_relation(&self) -> bool {
        match self.value.type_code {
            TypeCode::Pc | TypeCode::PcUntyped => true,
            TypeCode::Collection | TypeCode::Array => self.element.type_code.is_pc(),
            TypeCode::Map => self.element.type_code.is_pc() || self.key.type_code.is_pc(),
            _ => false,
        }
    }

    /// Related class of the field or its elements
    pub fn related_class(&self) -> Option<&str> {
        if self.value.type_code.is_pc() {
            self.value.related_class.as_deref()
        } else {
            self.element
                .related_class
                .as_deref()
                .or(self.key.related_class.as_deref())
        }
    }

    /// Cascade policy of the field, or of its elements for containers
    pub fn cascade_policy(&self, op: CascadeOp) -> CascadePolicy {
        if self.value.type_code.is_pc() {
            self.value.cascade(op)
        } else {
            let elem = self.element.cascade(op);
            let key = self.key.cascade(op);
            match (elem, key) {
                (CascadePolicy::Immediate, _) | (_, CascadePolicy::Immediate) => {
                    CascadePolicy::Immediate
                }
                (CascadePolicy::Auto, _) | (_, CascadePolicy::Auto) => CascadePolicy::Auto,
                _ => CascadePolicy::None,
            }
        }
    }

    /// Whether the field is stored
    pub fn is_persistent(&self) -> bool {
        self.management == Management::Persistent
    }

    /// Default value of the field
    pub fn default_value(&self) -> FieldValue {
        FieldValue::default_for(self.value.type_code)
    }
}
