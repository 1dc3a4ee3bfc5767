//! Type codes and per-value policies

use serde::{Deserialize, Serialize};

/// Type category of a field or of a collection element / map key / map value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeCode {
    /// boolean
    Boolean,
    /// 8-bit integer
    Byte,
    /// character
    Char,
    /// 16-bit integer
    Short,
    /// 32-bit integer
    Int,
    /// 64-bit integer
    Long,
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
    /// Arbitrary-precision decimal, carried as a double
    Number,
    /// string
    String,
    /// instant
    Date,
    /// calendar; stored like a date
    Calendar,
    /// Related persistent instance of a declared class
    Pc,
    /// Related persistent instance of any class
    PcUntyped,
    /// Object id value
    Oid,
    /// Collection of values
    Collection,
    /// Map of values
    Map,
    /// Array of values
    Array,
    /// Arbitrary serializable value
    Object,
}

impl TypeCode {
    /// Whether values of this type are plain scalars
    pub fn is_primitive(self) -> bool {
        matches!(
            self,
            TypeCode::Boolean
                | TypeCode::Byte
                | TypeCode::Char
                | TypeCode::Short
                | TypeCode::Int
                | TypeCode::Long
                | TypeCode::Float
                | TypeCode::Double
        )
    }

    /// Whether values are numeric
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            TypeCode::Byte
                | TypeCode::Short
                | TypeCode::Int
                | TypeCode::Long
                | TypeCode::Float
                | TypeCode::Double
                | TypeCode::Number
        )
    }

    /// Whether values reference persistent instances
    pub fn is_pc(self) -> bool {
        matches!(self, TypeCode::Pc | TypeCode::PcUntyped)
    }

    /// Whether values are containers
    pub fn is_container(self) -> bool {
        matches!(self, TypeCode::Collection | TypeCode::Map | TypeCode::Array)
    }
}

/// Whether an operation follows a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadePolicy {
    /// Never follow
    #[default]
    None,
    /// Follow lazily (at flush, or by reachability)
    Auto,
    /// Follow as part of the operation itself
    Immediate,
}

impl CascadePolicy {
    /// Whether the relation is followed at all
    pub fn cascades(self) -> bool {
        self != CascadePolicy::None
    }
}

/// Operations that may cascade over relations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CascadeOp {
    /// persist
    Persist,
    /// attach / merge
    Attach,
    /// detach
    Detach,
    /// delete
    Delete,
    /// refresh
    Refresh,
}

/// Per-operation cascade policies of one value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cascades {
    /// persist
    pub persist: CascadePolicy,
    /// attach
    pub attach: CascadePolicy,
    /// detach
    pub detach: CascadePolicy,
    /// delete
    pub delete: CascadePolicy,
    /// refresh
    pub refresh: CascadePolicy,
}

impl Cascades {
    /// Same policy for every operation
    pub fn all(policy: CascadePolicy) -> Self {
        Cascades {
            persist: policy,
            attach: policy,
            detach: policy,
            delete: policy,
            refresh: policy,
        }
    }

    /// Policy for one operation
    pub fn get(&self, op: CascadeOp) -> CascadePolicy {
        match op {
            CascadeOp::Persist => self.persist,
            CascadeOp::Attach => self.attach,
            CascadeOp::Detach => self.detach,
            CascadeOp::Delete => self.delete,
            CascadeOp::Refresh => self.refresh,
        }
    }

    /// Replace the policy for one operation
    pub fn set(&mut self, op: CascadeOp, policy: CascadePolicy) {
        match op {
            CascadeOp::Persist => self.persist = policy,
            CascadeOp::Attach => self.attach = policy,
            CascadeOp::Detach => self.detach = policy,
            CascadeOp::Delete => self.delete = policy,
            CascadeOp::Refresh => self.refresh = policy,
        }
    }
}

/// How a field participates in persistence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Management {
    /// Stored and tracked
    #[default]
    Persistent,
    /// Tracked for rollback but never stored
    Transactional,
    /// Ignored by the runtime
    None,
}

/// Identity scheme of a class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityType {
    /// Store-assigned surrogate ids
    #[default]
    Datastore,
    /// Ids derived from primary-key fields
    Application,
}

/// Where a class keeps its detached bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachedStateMode {
    /// Runtime-managed token; a detached state manager may be attached
    #[default]
    Synthetic,
    /// Token only, kept in a user-visible field
    Field,
    /// No bookkeeping; detached copies look like fresh instances
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_code_categories() {
        assert!(TypeCode::Int.is_primitive());
        assert!(!TypeCode::String.is_primitive());
        assert!(TypeCode::PcUntyped.is_pc());
        assert!(TypeCode::Map.is_container());
        assert!(TypeCode::Number.is_numeric());
    }

    #[test]
    fn test_cascades_get_set() {
        let mut c = Cascades::default();
        assert_eq!(c.get(CascadeOp::Detach), CascadePolicy::None);
        c.set(CascadeOp::Detach, CascadePolicy::Immediate);
        assert!(c.get(CascadeOp::Detach).cascades());
        assert!(!c.get(CascadeOp::Attach).cascades());
    }
}
