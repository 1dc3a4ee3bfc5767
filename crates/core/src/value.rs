//! Field value model
//!
//! [`FieldValue`] is the one currency every field read and write goes
//! through. Field managers, state managers, the store and the cache all pass
//! values by value in this tagged form, so no caller needs the field's
//! static type and no shared scratch slot is ever reused between calls.

use crate::meta::TypeCode;
use crate::types::{IdValue, ObjectId, Oref};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a collection value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionKind {
    /// Ordered, duplicates allowed
    List,
    /// Unordered, no duplicates
    Set,
}

/// Value of one persistent field
///
/// Floating-point variants follow IEEE semantics for equality
/// (`NaN != NaN`, `-0.0 == 0.0`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Null / absent
    Null,
    /// boolean
    Boolean(bool),
    /// 8-bit signed integer
    Byte(i8),
    /// character
    Char(char),
    /// 16-bit signed integer
    Short(i16),
    /// 32-bit signed integer
    Int(i32),
    /// 64-bit signed integer
    Long(i64),
    /// 32-bit float
    Float(f32),
    /// 64-bit float
    Double(f64),
    /// string
    String(String),
    /// instant
    Date(DateTime<Utc>),
    /// Reference to another instance in the same heap
    Ref(Oref),
    /// Reference by identity, used at the store boundary and in detached wire form
    ObjectId(ObjectId),
    /// Collection of values
    Collection {
        /// list or set
        kind: CollectionKind,
        /// members in iteration order
        items: Vec<FieldValue>,
    },
    /// Map as key/value entries in iteration order
    Map(Vec<(FieldValue, FieldValue)>),
    /// Fixed-length array
    Array(Vec<FieldValue>),
    /// Arbitrary serializable value
    Object(serde_json::Value),
}

macro_rules! typed_access {
    ($($name:ident => $variant:ident : $ty:ty),* $(,)?) => {
        impl FieldValue {
            $(
                #[doc = concat!("Payload if this is `", stringify!($variant), "`")]
                pub fn $name(&self) -> Option<$ty> {
                    match self {
                        FieldValue::$variant(v) => Some(v.clone()),
                        _ => None,
                    }
                }
            )*
        }
    };
}

typed_access! {
    as_boolean => Boolean: bool,
    as_byte => Byte: i8,
    as_char => Char: char,
    as_short => Short: i16,
    as_int => Int: i32,
    as_long => Long: i64,
    as_float => Float: f32,
    as_double => Double: f64,
    as_date => Date: DateTime<Utc>,
    as_ref => Ref: Oref,
    as_object_id => ObjectId: ObjectId,
}

impl FieldValue {
    /// New list value
    pub fn list(items: Vec<FieldValue>) -> Self {
        FieldValue::Collection {
            kind: CollectionKind::List,
            items,
        }
    }

    /// New set value; duplicates are dropped keeping first occurrence
    pub fn set(items: Vec<FieldValue>) -> Self {
        let mut unique: Vec<FieldValue> = Vec::with_capacity(items.len());
        for item in items {
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        FieldValue::Collection {
            kind: CollectionKind::Set,
            items: unique,
        }
    }

    /// Convenience string constructor
    pub fn string(s: impl Into<String>) -> Self {
        FieldValue::String(s.into())
    }

    /// Default value a field of this type holds before anything is stored
    pub fn default_for(type_code: TypeCode) -> Self {
        match type_code {
            TypeCode::Boolean => FieldValue::Boolean(false),
            TypeCode::Byte => FieldValue::Byte(0),
            TypeCode::Char => FieldValue::Char('\0'),
            TypeCode::Short => FieldValue::Short(0),
            TypeCode::Int => FieldValue::Int(0),
            TypeCode::Long => FieldValue::Long(0),
            TypeCode::Float => FieldValue::Float(0.0),
            TypeCode::Double => FieldValue::Double(0.0),
            _ => FieldValue::Null,
        }
    }

    /// Whether this is `Null`
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Borrowed string payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Collection members, array elements, or map values
    pub fn elements(&self) -> &[FieldValue] {
        match self {
            FieldValue::Collection { items, .. } => items,
            FieldValue::Array(items) => items,
            _ => &[],
        }
    }

    /// Whether the value is a mutable second-class object that must be
    /// copied rather than shared between instances
    pub fn is_second_class(&self) -> bool {
        matches!(
            self,
            FieldValue::Date(_)
                | FieldValue::Collection { .. }
                | FieldValue::Map(_)
                | FieldValue::Array(_)
                | FieldValue::Object(_)
        )
    }

    /// Every instance handle reachable directly from this value, in order
    pub fn refs(&self) -> Vec<Oref> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs(&self, out: &mut Vec<Oref>) {
        match self {
            FieldValue::Ref(r) => out.push(*r),
            FieldValue::Collection { items, .. } | FieldValue::Array(items) => {
                for item in items {
                    item.collect_refs(out);
                }
            }
            FieldValue::Map(entries) => {
                for (k, v) in entries {
                    k.collect_refs(out);
                    v.collect_refs(out);
                }
            }
            _ => {}
        }
    }

    /// Whether `oref` is referenced directly by this value
    pub fn contains_ref(&self, oref: Oref) -> bool {
        match self {
            FieldValue::Ref(r) => *r == oref,
            FieldValue::Collection { items, .. } | FieldValue::Array(items) => {
                items.iter().any(|i| i.contains_ref(oref))
            }
            FieldValue::Map(entries) => entries
                .iter()
                .any(|(k, v)| k.contains_ref(oref) || v.contains_ref(oref)),
            _ => false,
        }
    }

    /// Rebuild the value with every handle mapped through `f`.
    ///
    /// Stops at the first error.
    pub fn try_map_refs<E>(
        &self,
        f: &mut impl FnMut(Oref) -> Result<FieldValue, E>,
    ) -> Result<FieldValue, E> {
        Ok(match self {
            FieldValue::Ref(r) => f(*r)?,
            FieldValue::Collection { kind, items } => FieldValue::Collection {
                kind: *kind,
                items: items
                    .iter()
                    .map(|i| i.try_map_refs(f))
                    .collect::<Result<_, E>>()?,
            },
            FieldValue::Array(items) => FieldValue::Array(
                items
                    .iter()
                    .map(|i| i.try_map_refs(f))
                    .collect::<Result<_, E>>()?,
            ),
            FieldValue::Map(entries) => FieldValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.try_map_refs(f)?, v.try_map_refs(f)?)))
                    .collect::<Result<_, E>>()?,
            ),
            other => other.clone(),
        })
    }

    /// Identity key component for this value; `None` for values that
    /// cannot be part of a key (null, floats, containers, references)
    pub fn to_id_value(&self) -> Option<IdValue> {
        match self {
            FieldValue::Boolean(b) => Some(IdValue::Boolean(*b)),
            FieldValue::Char(c) => Some(IdValue::Char(*c)),
            FieldValue::Byte(n) => Some(IdValue::Long((*n).into())),
            FieldValue::Short(n) => Some(IdValue::Long((*n).into())),
            FieldValue::Int(n) => Some(IdValue::Long((*n).into())),
            FieldValue::Long(n) => Some(IdValue::Long(*n)),
            FieldValue::String(s) => Some(IdValue::String(s.clone())),
            _ => None,
        }
    }

    /// Field value for key component `id` in a field of type `type_code`
    pub fn from_id_value(id: &IdValue, type_code: TypeCode) -> FieldValue {
        match (id, type_code) {
            (IdValue::Boolean(b), _) => FieldValue::Boolean(*b),
            (IdValue::Char(c), _) => FieldValue::Char(*c),
            (IdValue::Long(n), TypeCode::Byte) => FieldValue::Byte(*n as i8),
            (IdValue::Long(n), TypeCode::Short) => FieldValue::Short(*n as i16),
            (IdValue::Long(n), TypeCode::Int) => FieldValue::Int(*n as i32),
            (IdValue::Long(n), _) => FieldValue::Long(*n),
            (IdValue::String(s), _) => FieldValue::String(s.clone()),
        }
    }

    /// Short name of the variant, for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Boolean(_) => "boolean",
            FieldValue::Byte(_) => "byte",
            FieldValue::Char(_) => "char",
            FieldValue::Short(_) => "short",
            FieldValue::Int(_) => "int",
            FieldValue::Long(_) => "long",
            FieldValue::Float(_) => "float",
            FieldValue::Double(_) => "double",
            FieldValue::String(_) => "string",
            FieldValue::Date(_) => "date",
            FieldValue::Ref(_) => "ref",
            FieldValue::ObjectId(_) => "oid",
            FieldValue::Collection { .. } => "collection",
            FieldValue::Map(_) => "map",
            FieldValue::Array(_) => "array",
            FieldValue::Object(_) => "object",
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Long(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Double(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<Oref> for FieldValue {
    fn from(v: Oref) -> Self {
        FieldValue::Ref(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}
