//! Copies of second-class values
//!
//! Dates, collections, maps, arrays and JSON objects are owned by the
//! instance that holds them. When a value moves to another instance (detach
//! with copying, attach of a new instance) the proxy manager produces the
//! copy the receiving instance keeps.

use stead_core::{FieldMetaData, FieldValue, SteadError, SteadResult};

/// Produces independent copies of second-class field values
pub trait ProxyManager: Send + Sync {
    /// Copy of `value` for field `fmd`; scalars and references come back
    /// unchanged
    fn copy_value(&self, fmd: &FieldMetaData, value: &FieldValue) -> SteadResult<FieldValue>;
}

/// Copies every built-in second-class value; `Object` values of fields
/// marked not copyable are rejected
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProxyManager;

impl ProxyManager for DefaultProxyManager {
    fn copy_value(&self, fmd: &FieldMetaData, value: &FieldValue) -> SteadResult<FieldValue> {
        match value {
            FieldValue::Object(_) if !fmd.copyable => Err(SteadError::user(format!(
                "value of field {} cannot be copied",
                fmd.name
            ))),
            FieldValue::Collection { items, .. } | FieldValue::Array(items)
                if items.iter().any(|i| matches!(i, FieldValue::Object(_))) && !fmd.copyable =>
            {
                Err(SteadError::user(format!(
                    "elements of field {} cannot be copied",
                    fmd.name
                )))
            }
            other => Ok(other.clone()),
        }
    }
}
