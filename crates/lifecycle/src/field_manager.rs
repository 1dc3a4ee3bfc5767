//! Field managers
//!
//! A field manager is the visitor that [`provide_field`] and
//! [`replace_field`] talk to: the state manager pushes one field's value into
//! it, or pulls one field's value out of it. Values always travel as an
//! owned [`FieldValue`]; a manager keeps no scratch state between calls.
//!
//! [`provide_field`]: crate::OpenStateManager::provide_field
//! [`replace_field`]: crate::OpenStateManager::replace_field

use chrono::{DateTime, Utc};
use stead_core::{
    CascadeOp, CascadePolicy, FieldMetaData, FieldValue, Oref, SteadError, SteadResult, TypeCode,
};

/// Visitor receiving and supplying field values by index
pub trait FieldManager {
    /// Accept the value of field `index`
    fn store_field(&mut self, index: usize, value: FieldValue) -> SteadResult<()>;

    /// Supply the value for field `index`
    fn fetch_field(&mut self, index: usize) -> SteadResult<FieldValue>;
}

macro_rules! typed_fetch {
    ($($fetch:ident / $store:ident => $variant:ident : $ty:ty),* $(,)?) => {
        /// Typed convenience accessors over any [`FieldManager`]
        pub trait TypedFieldManager: FieldManager {
            $(
                #[doc = concat!("Fetch field `index` as `", stringify!($ty), "`")]
                fn $fetch(&mut self, index: usize) -> SteadResult<$ty> {
                    match self.fetch_field(index)? {
                        FieldValue::$variant(v) => Ok(v),
                        other => Err(SteadError::internal(format!(
                            "field {} holds {}, expected {}",
                            index,
                            other.type_name(),
                            stringify!($variant)
                        ))),
                    }
                }

                #[doc = concat!("Store `", stringify!($ty), "` into field `index`")]
                fn $store(&mut self, index: usize, value: $ty) -> SteadResult<()> {
                    self.store_field(index, FieldValue::$variant(value))
                }
            )*
        }
    };
}

typed_fetch! {
    fetch_boolean_field / store_boolean_field => Boolean: bool,
    fetch_byte_field / store_byte_field => Byte: i8,
    fetch_char_field / store_char_field => Char: char,
    fetch_short_field / store_short_field => Short: i16,
    fetch_int_field / store_int_field => Int: i32,
    fetch_long_field / store_long_field => Long: i64,
    fetch_float_field / store_float_field => Float: f32,
    fetch_double_field / store_double_field => Double: f64,
    fetch_string_field / store_string_field => String: String,
    fetch_date_field / store_date_field => Date: DateTime<Utc>,
}

impl<T: FieldManager + ?Sized> TypedFieldManager for T {}

// =============================================================================
// TransferFieldManager
// =============================================================================

/// Carries exactly one field value from a provider to a receiver
#[derive(Debug, Default)]
pub struct TransferFieldManager {
    slot: Option<(usize, FieldValue)>,
}

impl TransferFieldManager {
    /// Empty transfer
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the carried value out, leaving the manager empty
    pub fn take(&mut self) -> Option<(usize, FieldValue)> {
        self.slot.take()
    }
}

impl FieldManager for TransferFieldManager {
    fn store_field(&mut self, index: usize, value: FieldValue) -> SteadResult<()> {
        self.slot = Some((index, value));
        Ok(())
    }

    fn fetch_field(&mut self, index: usize) -> SteadResult<FieldValue> {
        match self.slot.take() {
            Some((i, value)) if i == index => Ok(value),
            Some((i, _)) => Err(SteadError::internal(format!(
                "transfer holds field {} but field {} was requested",
                i, index
            ))),
            None => Err(SteadError::internal(format!(
                "transfer is empty; field {} was requested",
                index
            ))),
        }
    }
}

// =============================================================================
// SingleFieldManager
// =============================================================================

/// Operations over a single field's value: cascade gathering, dependent
/// dereferencing and second-class-object checks.
#[derive(Debug)]
pub struct SingleFieldManager<'a> {
    fmd: &'a FieldMetaData,
    value: FieldValue,
}

impl<'a> SingleFieldManager<'a> {
    /// Wrap field `fmd` holding `value`
    pub fn new(fmd: &'a FieldMetaData, value: FieldValue) -> Self {
        SingleFieldManager { fmd, value }
    }

    /// The wrapped value
    pub fn value(&self) -> &FieldValue {
        &self.value
    }

    /// Consume and return the wrapped value
    pub fn into_value(self) -> FieldValue {
        self.value
    }

    /// Instances `op` must visit through this field, given the policies
    /// accepted (e.g. only `Immediate` at call time, `Auto` too at flush).
    /// LRS fields are never walked.
    pub fn gather_cascade(&self, op: CascadeOp, accept: &[CascadePolicy]) -> Vec<Oref> {
        if self.fmd.lrs || !self.fmd.is_relation() {
            return Vec::new();
        }
        if !accept.contains(&self.fmd.cascade_policy(op)) {
            return Vec::new();
        }
        self.value.refs()
    }

    /// Related instances this field references regardless of policy
    pub fn references(&self) -> Vec<Oref> {
        if self.fmd.is_relation() {
            self.value.refs()
        } else {
            Vec::new()
        }
    }

    /// Dependent instances to delete when the owner is deleted
    pub fn dependents(&self) -> Vec<Oref> {
        self.gather_cascade(
            CascadeOp::Delete,
            &[CascadePolicy::Auto, CascadePolicy::Immediate],
        )
    }

    /// Whether the value is the field's default
    pub fn is_default_value(&self) -> bool {
        match self.fmd.type_code() {
            TypeCode::Collection | TypeCode::Array => {
                self.value.is_null() || self.value.elements().is_empty()
            }
            TypeCode::Map => match &self.value {
                FieldValue::Null => true,
                FieldValue::Map(entries) => entries.is_empty(),
                _ => false,
            },
            _ => self.value == self.fmd.default_value(),
        }
    }

    /// Remove `target` from the value: a to-one reference becomes null,
    /// collection members and map entries referencing it are dropped
    pub fn without_ref(&self, target: Oref) -> FieldValue {
        match &self.value {
            FieldValue::Ref(r) if *r == target => FieldValue::Null,
            FieldValue::Collection { kind, items } => FieldValue::Collection {
                kind: *kind,
                items: items
                    .iter()
                    .filter(|i| !i.contains_ref(target))
                    .cloned()
                    .collect(),
            },
            FieldValue::Array(items) => FieldValue::Array(
                items
                    .iter()
                    .map(|i| if i.contains_ref(target) { FieldValue::Null } else { i.clone() })
                    .collect(),
            ),
            FieldValue::Map(entries) => FieldValue::Map(
                entries
                    .iter()
                    .filter(|(k, v)| !k.contains_ref(target) && !v.contains_ref(target))
                    .cloned()
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Add `target` to the value: a to-one reference is replaced,
    /// collections gain it unless a set already holds it
    pub fn with_ref(&self, target: Oref) -> FieldValue {
        match &self.value {
            FieldValue::Collection { kind, items } => {
                let mut items = items.clone();
                if !items.iter().any(|i| i.contains_ref(target)) {
                    items.push(FieldValue::Ref(target));
                }
                FieldValue::Collection { kind: *kind, items }
            }
            FieldValue::Null if self.fmd.type_code() == TypeCode::Collection => {
                FieldValue::Collection {
                    kind: self.fmd.collection_kind,
                    items: vec![FieldValue::Ref(target)],
                }
            }
            _ => FieldValue::Ref(target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stead_core::CollectionKind;

    #[test]
    fn test_transfer_carries_one_value() {
        let mut tm = TransferFieldManager::new();
        tm.store_int_field(2, 7).unwrap();
        assert_eq!(tm.fetch_int_field(2).unwrap(), 7);
        assert!(tm.fetch_field(2).is_err());
    }

    #[test]
    fn test_transfer_rejects_wrong_index() {
        let mut tm = TransferFieldManager::new();
        tm.store_field(1, FieldValue::Null).unwrap();
        assert!(matches!(tm.fetch_field(0), Err(SteadError::Internal(_))));
    }

    #[test]
    fn test_typed_fetch_mismatch_is_internal() {
        let mut tm = TransferFieldManager::new();
        tm.store_string_field(0, "x".into()).unwrap();
        assert!(matches!(tm.fetch_int_field(0), Err(SteadError::Internal(_))));
    }

    #[test]
    fn test_gather_cascade_respects_policy() {
        let a = Oref::new(1, 0);
        let fmd = FieldMetaData::collection_of("items", "Item", CollectionKind::List)
            .cascade(CascadeOp::Persist, CascadePolicy::Auto);
        let sfm = SingleFieldManager::new(&fmd, FieldValue::list(vec![a.into()]));
        assert_eq!(
            sfm.gather_cascade(CascadeOp::Persist, &[CascadePolicy::Auto]),
            vec![a]
        );
        assert!(sfm
            .gather_cascade(CascadeOp::Persist, &[CascadePolicy::Immediate])
            .is_empty());
        assert!(sfm
            .gather_cascade(CascadeOp::Detach, &[CascadePolicy::Immediate])
            .is_empty());
    }

    #[test]
    fn test_lrs_never_gathered() {
        let fmd = FieldMetaData::collection_of("items", "Item", CollectionKind::List)
            .cascade_all(CascadePolicy::Immediate)
            .lrs();
        let sfm = SingleFieldManager::new(&fmd, FieldValue::list(vec![Oref::new(0, 0).into()]));
        assert!(sfm
            .gather_cascade(CascadeOp::Detach, &[CascadePolicy::Immediate])
            .is_empty());
    }

    #[test]
    fn test_with_and_without_ref() {
        let (a, b) = (Oref::new(0, 0), Oref::new(1, 0));
        let fmd = FieldMetaData::collection_of("bs", "B", CollectionKind::Set);
        let sfm = SingleFieldManager::new(&fmd, FieldValue::Null);
        let with_a = sfm.with_ref(a);
        let sfm = SingleFieldManager::new(&fmd, with_a);
        let both = sfm.with_ref(b);
        assert_eq!(both.refs(), vec![a, b]);
        let sfm = SingleFieldManager::new(&fmd, both);
        assert_eq!(sfm.without_ref(a).refs(), vec![b]);

        let to_one = FieldMetaData::relation("a", "A");
        let sfm = SingleFieldManager::new(&to_one, FieldValue::Ref(a));
        assert_eq!(sfm.without_ref(a), FieldValue::Null);
        assert_eq!(sfm.without_ref(b), FieldValue::Ref(a));
    }

    #[test]
    fn test_is_default_value() {
        let fmd = FieldMetaData::new("age", TypeCode::Int);
        assert!(SingleFieldManager::new(&fmd, FieldValue::Int(0)).is_default_value());
        assert!(!SingleFieldManager::new(&fmd, FieldValue::Int(3)).is_default_value());
    }
}
