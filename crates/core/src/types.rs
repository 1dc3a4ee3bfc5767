//! Identity types shared by every layer
//!
//! - [`Oref`]: handle to an instance living in a broker heap
//! - [`ObjectId`]: persistent identity of an instance (datastore, application or temporary)
//! - [`IdValue`]: one component of an application identity key

use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle to an instance stored in a broker heap.
///
/// Two handles are equal when they name the same slot *and* the same
/// generation, so a handle that outlives its slot never aliases the slot's
/// next occupant. Instance identity everywhere in the runtime is handle
/// equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Oref {
    index: u32,
    generation: u32,
}

impl Oref {
    /// Create a handle from raw parts
    pub const fn new(index: u32, generation: u32) -> Self {
        Oref { index, generation }
    }

    /// Slot index
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Oref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// One component of an application identity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdValue {
    /// Boolean key component
    Boolean(bool),
    /// Character key component
    Char(char),
    /// Integral key component (byte/short/int/long all widen here)
    Long(i64),
    /// String key component
    String(String),
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdValue::Boolean(b) => write!(f, "{}", b),
            IdValue::Char(c) => write!(f, "{}", c),
            IdValue::Long(n) => write!(f, "{}", n),
            IdValue::String(s) => write!(f, "{}", s),
        }
    }
}

/// Key part of an [`ObjectId`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdKey {
    /// Store-assigned surrogate key
    Datastore(i64),
    /// Key derived from the primary-key fields, in declaration order
    Application(Vec<IdValue>),
    /// Placeholder assigned before the permanent id is known
    Temporary(u64),
}

/// Persistent identity of an instance.
///
/// The class name is part of the identity so that lookups can resolve
/// metadata without a separate type hint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    class: String,
    key: IdKey,
}

impl ObjectId {
    /// Datastore identity
    pub fn datastore(class: impl Into<String>, id: i64) -> Self {
        ObjectId {
            class: class.into(),
            key: IdKey::Datastore(id),
        }
    }

    /// Application identity from primary key components
    pub fn application(class: impl Into<String>, key: Vec<IdValue>) -> Self {
        ObjectId {
            class: class.into(),
            key: IdKey::Application(key),
        }
    }

    /// Temporary identity
    pub fn temporary(class: impl Into<String>, seq: u64) -> Self {
        ObjectId {
            class: class.into(),
            key: IdKey::Temporary(seq),
        }
    }

    /// Class name this id belongs to
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Key part
    pub fn key(&self) -> &IdKey {
        &self.key
    }

    /// Whether this id is a placeholder awaiting a permanent assignment
    pub fn is_temporary(&self) -> bool {
        matches!(self.key, IdKey::Temporary(_))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            IdKey::Datastore(id) => write!(f, "{}-{}", self.class, id),
            IdKey::Temporary(seq) => write!(f, "{}-temp{}", self.class, seq),
            IdKey::Application(parts) => {
                write!(f, "{}-", self.class)?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, "::")?;
                    }
                    write!(f, "{}", part)?;
                }
                Ok(())
            }
        }
    }
}

/// Diagnostic description of the instance an error is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedObject {
    /// Heap handle, when the instance lives in a heap
    pub oref: Option<Oref>,
    /// Persistent identity, when known
    pub oid: Option<ObjectId>,
    /// Class name
    pub class: String,
}

impl FailedObject {
    /// Describe an instance by class and optional handle/id
    pub fn new(class: impl Into<String>, oref: Option<Oref>, oid: Option<ObjectId>) -> Self {
        FailedObject {
            oref,
            oid,
            class: class.into(),
        }
    }
}

impl fmt::Display for FailedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.oid, &self.oref) {
            (Some(oid), _) => write!(f, "{}", oid),
            (None, Some(oref)) => write!(f, "{}@{}", self.class, oref),
            (None, None) => write!(f, "{}", self.class),
        }
    }
}
