//! State manager for embedded identity values
//!
//! An application identity may itself be a small persistent-capable value
//! (a compound key). [`ObjectIdStateManager`] gives field access to it while
//! it lives inside its owner, creating the value lazily on the first
//! non-null write. It has no lifecycle of its own.

use crate::pc_state::PCState;
use crate::state_manager::{ImplData, ObjectIdAssigner, OpenStateManager, SetKind};
use std::any::Any;
use std::sync::Arc;
use stead_core::{
    ClassMetaData, FieldSet, FieldValue, IdValue, ObjectId, Oref, PersistenceCapable, Record,
    SteadError, SteadResult, Version,
};

/// Field access over an embedded identity value
#[derive(Debug)]
pub struct ObjectIdStateManager {
    id: Box<dyn PersistenceCapable>,
    instantiated: bool,
    meta: Arc<ClassMetaData>,
    owner: Option<(Oref, usize)>,
    loaded: FieldSet,
    empty: FieldSet,
}

impl ObjectIdStateManager {
    /// Manager over `id`; with `None` a value is created on the first
    /// non-null write
    pub fn new(
        meta: Arc<ClassMetaData>,
        id: Option<Box<dyn PersistenceCapable>>,
        owner: Option<(Oref, usize)>,
    ) -> Self {
        let n = meta.field_count();
        let instantiated = id.is_some();
        let id = match id {
            Some(id) => id,
            None => Box::new(Record::new(Arc::clone(&meta))),
        };
        ObjectIdStateManager {
            id,
            instantiated,
            meta,
            owner,
            loaded: FieldSet::full(n),
            empty: FieldSet::new(n),
        }
    }

    /// Whether an identity value exists
    pub fn is_instantiated(&self) -> bool {
        self.instantiated
    }

    /// The identity value, if one was ever created
    pub fn into_id(self) -> Option<Box<dyn PersistenceCapable>> {
        self.instantiated.then_some(self.id)
    }

    /// Key components in field order, for building an [`ObjectId`]
    pub fn key_values(&self) -> SteadResult<Vec<IdValue>> {
        if !self.instantiated {
            return Err(SteadError::user(format!(
                "identity of class {} has not been assigned",
                self.meta.name()
            )));
        }
        (0..self.meta.field_count())
            .map(|i| {
                let value = self.id.provide_field(i);
                value.to_id_value().ok_or_else(|| {
                    SteadError::user(format!(
                        "identity field {}.{} holds {}, which cannot be part of a key",
                        self.meta.name(),
                        self.meta.field(i).map_or("?", |f| f.name.as_str()),
                        value.type_name()
                    ))
                })
            })
            .collect()
    }

    /// Identity for an instance of `class` keyed by this value
    pub fn to_object_id(&self, class: &str) -> SteadResult<ObjectId> {
        Ok(ObjectId::application(class, self.key_values()?))
    }
}

impl OpenStateManager for ObjectIdStateManager {
    fn manager_name(&self) -> &'static str {
        "ObjectIdStateManager"
    }

    fn meta(&self) -> &Arc<ClassMetaData> {
        &self.meta
    }

    fn pc(&self) -> &dyn PersistenceCapable {
        self.id.as_ref()
    }

    fn object_id(&self) -> Option<&ObjectId> {
        None
    }

    fn assign_object_id(&mut self, _assigner: &mut dyn ObjectIdAssigner) -> SteadResult<bool> {
        Err(SteadError::unsupported("assign_object_id", self.manager_name()))
    }

    fn version(&self) -> Option<&Version> {
        None
    }

    fn set_version(&mut self, _version: Option<Version>) -> SteadResult<()> {
        Err(SteadError::unsupported("set_version", self.manager_name()))
    }

    fn pc_state(&self) -> Option<PCState> {
        None
    }

    fn loaded(&self) -> &FieldSet {
        &self.loaded
    }

    fn dirty(&self) -> &FieldSet {
        &self.empty
    }

    fn flushed(&self) -> &FieldSet {
        &self.empty
    }

    fn owner(&self) -> Option<(Oref, usize)> {
        self.owner
    }

    fn is_detached(&self) -> bool {
        false
    }

    fn is_version_check_required(&self) -> bool {
        false
    }

    fn is_version_update_required(&self) -> bool {
        false
    }

    fn accessing_field(&self, index: usize) -> SteadResult<()> {
        self.meta.require_field(index).map(|_| ())
    }

    fn fetch_field(&self, index: usize) -> SteadResult<FieldValue> {
        let fmd = self.meta.require_field(index)?;
        if self.instantiated {
            Ok(self.id.provide_field(index))
        } else {
            Ok(fmd.default_value())
        }
    }

    fn store_field(&mut self, index: usize, value: FieldValue) -> SteadResult<()> {
        let fmd = self.meta.require_field(index)?;
        if !self.instantiated {
            if value.is_null() || value == fmd.default_value() {
                return Ok(());
            }
            self.instantiated = true;
        }
        self.id.replace_field(index, value);
        Ok(())
    }

    fn setting_field(
        &mut self,
        index: usize,
        _current: &FieldValue,
        next: FieldValue,
        _kind: SetKind,
    ) -> SteadResult<bool> {
        self.store_field(index, next)?;
        Ok(true)
    }

    fn dirty_field(&mut self, _index: usize) -> SteadResult<()> {
        Err(SteadError::unsupported("dirty_field", self.manager_name()))
    }

    fn impl_data(&self) -> Option<&(dyn Any + Send + Sync)> {
        None
    }

    fn set_impl_data(&mut self, _data: Option<ImplData>) -> SteadResult<Option<ImplData>> {
        Err(SteadError::unsupported("set_impl_data", self.manager_name()))
    }

    fn field_impl_data(&self, _index: usize) -> Option<&(dyn Any + Send + Sync)> {
        None
    }

    fn set_field_impl_data(
        &mut self,
        _index: usize,
        _data: Option<ImplData>,
    ) -> SteadResult<Option<ImplData>> {
        Err(SteadError::unsupported("set_field_impl_data", self.manager_name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stead_core::{FieldMetaData, TypeCode};

    fn key_meta() -> Arc<ClassMetaData> {
        ClassMetaData::builder("OrderKey")
            .field(FieldMetaData::new("region", TypeCode::String))
            .field(FieldMetaData::new("number", TypeCode::Int))
            .build()
            .unwrap()
    }

    #[test]
    fn test_reads_default_before_any_write() {
        let sm = ObjectIdStateManager::new(key_meta(), None, None);
        assert_eq!(sm.fetch_field(1).unwrap(), FieldValue::Int(0));
        assert!(!sm.is_instantiated());
    }

    #[test]
    fn test_null_write_does_not_instantiate() {
        let mut sm = ObjectIdStateManager::new(key_meta(), None, None);
        sm.store_field(0, FieldValue::Null).unwrap();
        assert!(sm.into_id().is_none());
    }

    #[test]
    fn test_first_value_instantiates() {
        let mut sm = ObjectIdStateManager::new(key_meta(), None, Some((Oref::new(4, 0), 0)));
        assert!(sm
            .setting_field(0, &FieldValue::Null, "eu".into(), SetKind::User)
            .unwrap());
        sm.store_field(1, 9.into()).unwrap();
        assert_eq!(sm.owner(), Some((Oref::new(4, 0), 0)));
        let oid = sm.to_object_id("Order").unwrap();
        assert_eq!(
            oid,
            ObjectId::application(
                "Order",
                vec![IdValue::String("eu".into()), IdValue::Long(9)]
            )
        );
    }

    #[test]
    fn test_datastore_operations_unsupported() {
        let mut sm = ObjectIdStateManager::new(key_meta(), None, None);
        assert!(matches!(
            sm.set_version(Some(Version::Counter(1))),
            Err(SteadError::Unsupported { .. })
        ));
        assert!(sm.dirty_field(0).is_err());
        assert!(sm.key_values().is_err());
    }
}
