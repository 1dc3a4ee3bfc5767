//! State managers for detached instances
//!
//! [`DetachedStateManager`] rides along with a detached copy and records
//! which captured fields the application changed afterwards, so a later
//! attach knows exactly what to merge. [`DetachedValueStateManager`] is a
//! read-only view used while a detached instance is written out.

use crate::field_manager::FieldManager;
use crate::pc_state::PCState;
use crate::state_manager::{ImplData, ObjectIdAssigner, OpenStateManager, SetKind};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::any::Any;
use std::sync::Arc;
use stead_core::{
    ClassMetaData, DetachedState, FieldSet, FieldValue, ObjectId, Oref, PersistenceCapable,
    SteadError, SteadResult, Version,
};

/// Bookkeeping captured from a managed instance at detach time
#[derive(Debug, Clone, PartialEq)]
pub struct DetachedSnapshot {
    /// Identity
    pub oid: Option<ObjectId>,
    /// Version; `None` when the instance had none
    pub version: Option<Version>,
    /// Fields carried over
    pub loaded: FieldSet,
    /// Carried fields whose changes had not reached the store
    pub dirty: FieldSet,
    /// Whether the instance was embedded
    pub embedded: bool,
}

/// Options fixed when a detached state manager is created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetachedOptions {
    /// Reads of fields that were not captured return the default value
    /// instead of failing
    pub access_unloaded: bool,
    /// Guard mutation with an internal reentrant lock
    pub multithreaded: bool,
}

// =============================================================================
// DetachedStateManager
// =============================================================================

/// State manager of a detached copy
pub struct DetachedStateManager {
    pc: Box<dyn PersistenceCapable>,
    meta: Arc<ClassMetaData>,
    oid: Option<ObjectId>,
    version: Option<Version>,
    loaded: FieldSet,
    dirty: FieldSet,
    flushed: FieldSet,
    embedded: bool,
    access_unloaded: bool,
    lock: Option<ReentrantMutex<()>>,
}

impl std::fmt::Debug for DetachedStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetachedStateManager")
            .field("class", &self.meta.name())
            .field("oid", &self.oid)
            .field("version", &self.version)
            .field("loaded", &self.loaded)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl DetachedStateManager {
    /// Wrap the detached copy `pc`
    pub fn new(
        pc: Box<dyn PersistenceCapable>,
        snapshot: DetachedSnapshot,
        options: DetachedOptions,
    ) -> Self {
        let meta = Arc::clone(pc.meta());
        let n = meta.field_count();
        let mut dirty = snapshot.dirty;
        dirty.intersect_with(&snapshot.loaded);
        DetachedStateManager {
            pc,
            meta,
            oid: snapshot.oid,
            version: snapshot.version,
            loaded: snapshot.loaded,
            dirty,
            flushed: FieldSet::new(n),
            embedded: snapshot.embedded,
            access_unloaded: options.access_unloaded,
            lock: options.multithreaded.then(|| ReentrantMutex::new(())),
        }
    }

    /// Rebuild a manager from the token a detached instance carries
    pub fn from_token(pc: Box<dyn PersistenceCapable>, options: DetachedOptions) -> Option<Self> {
        let token = pc.detached_state()?.clone();
        Some(DetachedStateManager::new(
            pc,
            DetachedSnapshot {
                oid: token.oid,
                version: token.version,
                loaded: token.loaded,
                dirty: token.dirty,
                embedded: token.embedded,
            },
            options,
        ))
    }

    /// Token equivalent of this manager's bookkeeping
    pub fn to_token(&self) -> DetachedState {
        DetachedState {
            oid: self.oid.clone(),
            version: self.version.clone(),
            loaded: self.loaded.clone(),
            dirty: self.dirty.clone(),
            embedded: self.embedded,
        }
    }

    /// Acquire the internal lock; `None` when not multithreaded
    pub fn lock(&self) -> Option<ReentrantMutexGuard<'_, ()>> {
        self.lock.as_ref().map(|l| l.lock())
    }

    /// Whether reads of uncaptured fields are tolerated
    pub fn access_unloaded(&self) -> bool {
        self.access_unloaded
    }

    /// Mutable instance access
    pub fn pc_mut(&mut self) -> &mut dyn PersistenceCapable {
        self.pc.as_mut()
    }

    /// Give up the instance and the current bookkeeping
    pub fn into_parts(self) -> (Box<dyn PersistenceCapable>, DetachedSnapshot) {
        (
            self.pc,
            DetachedSnapshot {
                oid: self.oid,
                version: self.version,
                loaded: self.loaded,
                dirty: self.dirty,
                embedded: self.embedded,
            },
        )
    }
}

impl OpenStateManager for DetachedStateManager {
    fn manager_name(&self) -> &'static str {
        "DetachedStateManager"
    }

    fn meta(&self) -> &Arc<ClassMetaData> {
        &self.meta
    }

    fn pc(&self) -> &dyn PersistenceCapable {
        self.pc.as_ref()
    }

    fn object_id(&self) -> Option<&ObjectId> {
        self.oid.as_ref()
    }

    fn assign_object_id(&mut self, _assigner: &mut dyn ObjectIdAssigner) -> SteadResult<bool> {
        Err(SteadError::unsupported("assign_object_id", self.manager_name()))
    }

    fn version(&self) -> Option<&Version> {
        self.version.as_ref()
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
        &self.dirty
    }

    fn flushed(&self) -> &FieldSet {
        &self.flushed
    }

    fn owner(&self) -> Option<(Oref, usize)> {
        None
    }

    fn is_detached(&self) -> bool {
        true
    }

    fn is_embedded(&self) -> bool {
        self.embedded
    }

    fn is_persistent(&self) -> bool {
        self.oid.is_some()
    }

    fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    fn is_version_check_required(&self) -> bool {
        false
    }

    fn is_version_update_required(&self) -> bool {
        false
    }

    fn accessing_field(&self, index: usize) -> SteadResult<()> {
        let fmd = self.meta.require_field(index)?;
        if !self.access_unloaded && !self.loaded.contains(index) {
            return Err(SteadError::UnloadedDetached {
                class: self.meta.name().to_string(),
                field: fmd.name.clone(),
            });
        }
        Ok(())
    }

    fn fetch_field(&self, index: usize) -> SteadResult<FieldValue> {
        self.meta.require_field(index)?;
        Ok(self.pc.provide_field(index))
    }

    fn store_field(&mut self, index: usize, value: FieldValue) -> SteadResult<()> {
        self.meta.require_field(index)?;
        let _guard = self.lock.as_ref().map(|l| l.lock());
        self.pc.replace_field(index, value);
        Ok(())
    }

    fn setting_field(
        &mut self,
        index: usize,
        current: &FieldValue,
        next: FieldValue,
        _kind: SetKind,
    ) -> SteadResult<bool> {
        self.accessing_field(index)?;
        if *current == next && self.loaded.contains(index) {
            return Ok(false);
        }
        let _guard = self.lock.as_ref().map(|l| l.lock());
        self.loaded.insert(index);
        self.dirty.insert(index);
        self.pc.replace_field(index, next);
        Ok(true)
    }

    fn dirty_field(&mut self, index: usize) -> SteadResult<()> {
        self.accessing_field(index)?;
        let _guard = self.lock.as_ref().map(|l| l.lock());
        if self.loaded.contains(index) {
            self.dirty.insert(index);
        }
        Ok(())
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

// =============================================================================
// DetachedValueStateManager
// =============================================================================

/// Read-only view over a detached instance, used while writing it out
pub struct DetachedValueStateManager<'a> {
    pc: &'a dyn PersistenceCapable,
    oid: Option<ObjectId>,
    version: Option<Version>,
    loaded: FieldSet,
    empty: FieldSet,
}

impl<'a> DetachedValueStateManager<'a> {
    /// View `pc` with the given captured bookkeeping
    pub fn new(pc: &'a dyn PersistenceCapable, token: Option<&DetachedState>) -> Self {
        let n = pc.meta().field_count();
        let (oid, version, loaded) = match token {
            Some(t) => (t.oid.clone(), t.version.clone(), t.loaded.clone()),
            None => (None, None, FieldSet::full(n)),
        };
        DetachedValueStateManager {
            pc,
            oid,
            version,
            loaded,
            empty: FieldSet::new(n),
        }
    }

    /// Push every captured field into `fm`, in index order
    pub fn provide_loaded(&self, fm: &mut dyn FieldManager) -> SteadResult<()> {
        for index in self.loaded.iter() {
            self.provide_field(fm, index)?;
        }
        Ok(())
    }
}

impl OpenStateManager for DetachedValueStateManager<'_> {
    fn manager_name(&self) -> &'static str {
        "DetachedValueStateManager"
    }

    fn meta(&self) -> &Arc<ClassMetaData> {
        self.pc.meta()
    }

    fn pc(&self) -> &dyn PersistenceCapable {
        self.pc
    }

    fn object_id(&self) -> Option<&ObjectId> {
        self.oid.as_ref()
    }

    fn assign_object_id(&mut self, _assigner: &mut dyn ObjectIdAssigner) -> SteadResult<bool> {
        Err(SteadError::unsupported("assign_object_id", self.manager_name()))
    }

    fn version(&self) -> Option<&Version> {
        self.version.as_ref()
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
        None
    }

    fn is_detached(&self) -> bool {
        true
    }

    fn is_version_check_required(&self) -> bool {
        false
    }

    fn is_version_update_required(&self) -> bool {
        false
    }

    fn accessing_field(&self, index: usize) -> SteadResult<()> {
        self.meta().require_field(index).map(|_| ())
    }

    fn fetch_field(&self, index: usize) -> SteadResult<FieldValue> {
        self.meta().require_field(index)?;
        Ok(self.pc.provide_field(index))
    }

    fn store_field(&mut self, _index: usize, _value: FieldValue) -> SteadResult<()> {
        Err(SteadError::unsupported("store_field", self.manager_name()))
    }

    fn setting_field(
        &mut self,
        _index: usize,
        _current: &FieldValue,
        _next: FieldValue,
        _kind: SetKind,
    ) -> SteadResult<bool> {
        Err(SteadError::unsupported("setting_field", self.manager_name()))
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
    use crate::field_manager::TransferFieldManager;
    use stead_core::{FieldMetaData, Record, TypeCode};

    fn meta() -> Arc<ClassMetaData> {
        ClassMetaData::builder("Person")
            .field(FieldMetaData::new("name", TypeCode::String))
            .field(FieldMetaData::new("age", TypeCode::Int))
            .field(FieldMetaData::new("notes", TypeCode::String))
            .build()
            .unwrap()
    }

    fn detached(options: DetachedOptions) -> DetachedStateManager {
        let pc = Record::new(meta()).with("name", "Ann").with("age", 30);
        DetachedStateManager::new(
            Box::new(pc),
            DetachedSnapshot {
                oid: Some(ObjectId::datastore("Person", 1)),
                version: Some(Version::Counter(3)),
                loaded: FieldSet::from_indices(3, [0, 1]),
                dirty: FieldSet::new(3),
                embedded: false,
            },
            options,
        )
    }

    #[test]
    fn test_unloaded_access_fails_fast() {
        let dsm = detached(DetachedOptions::default());
        assert!(dsm.accessing_field(1).is_ok());
        let err = dsm.accessing_field(2).unwrap_err();
        assert!(matches!(err, SteadError::UnloadedDetached { ref field, .. } if field == "notes"));
    }

    #[test]
    fn test_unloaded_access_tolerated_when_configured() {
        let dsm = detached(DetachedOptions {
            access_unloaded: true,
            multithreaded: false,
        });
        assert!(dsm.accessing_field(2).is_ok());
    }

    #[test]
    fn test_write_to_uncaptured_field_becomes_loaded_and_dirty() {
        let mut dsm = detached(DetachedOptions {
            access_unloaded: true,
            multithreaded: false,
        });
        let cur = dsm.fetch_field(2).unwrap();
        assert!(dsm.setting_field(2, &cur, "vip".into(), SetKind::User).unwrap());
        assert!(dsm.loaded().contains(2));
        assert!(dsm.dirty().contains(2));
    }

    #[test]
    fn test_setting_changed_loaded_field_marks_dirty() {
        let mut dsm = detached(DetachedOptions::default());
        let cur = dsm.fetch_field(1).unwrap();
        assert!(dsm.setting_field(1, &cur, 31.into(), SetKind::User).unwrap());
        assert_eq!(dsm.dirty().iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(dsm.fetch_field(1).unwrap(), FieldValue::Int(31));
        assert!(dsm.is_dirty());
    }

    #[test]
    fn test_setting_same_value_keeps_clean() {
        let mut dsm = detached(DetachedOptions::default());
        let cur = dsm.fetch_field(0).unwrap();
        assert!(!dsm.setting_field(0, &cur, "Ann".into(), SetKind::User).unwrap());
        assert!(dsm.dirty().is_empty());
    }

    #[test]
    fn test_multithreaded_lock_is_reentrant() {
        let mut dsm = detached(DetachedOptions {
            access_unloaded: false,
            multithreaded: true,
        });
        {
            let outer = dsm.lock();
            assert!(outer.is_some());
            let inner = dsm.lock();
            assert!(inner.is_some());
        }
        let cur = dsm.fetch_field(1).unwrap();
        assert!(dsm.setting_field(1, &cur, 5.into(), SetKind::User).unwrap());
        assert!(detached(DetachedOptions::default()).lock().is_none());
    }

    #[test]
    fn test_datastore_operations_unsupported() {
        let mut dsm = detached(DetachedOptions::default());
        assert!(matches!(
            dsm.set_version(None),
            Err(SteadError::Unsupported { .. })
        ));
        assert!(dsm.set_impl_data(None).is_err());
        assert_eq!(dsm.pc_state(), None);
        assert!(dsm.is_detached());
    }

    #[test]
    fn test_token_roundtrip() {
        let mut dsm = detached(DetachedOptions::default());
        dsm.dirty_field(0).unwrap();
        let token = dsm.to_token();
        let (mut pc, _) = dsm.into_parts();
        pc.set_detached_state(Some(token.clone()));
        let rebuilt = DetachedStateManager::from_token(pc, DetachedOptions::default()).unwrap();
        assert_eq!(rebuilt.to_token(), token);
    }

    #[test]
    fn test_token_keeps_embedded_flag_and_carried_dirty() {
        let pc = Record::new(meta()).with("name", "Ann").with("age", 31);
        let dsm = DetachedStateManager::new(
            Box::new(pc),
            DetachedSnapshot {
                oid: None,
                version: None,
                loaded: FieldSet::from_indices(3, [0, 1]),
                dirty: FieldSet::from_indices(3, [1, 2]),
                embedded: true,
            },
            DetachedOptions::default(),
        );
        assert!(dsm.is_embedded());
        // only carried fields stay dirty
        assert_eq!(dsm.dirty().iter().collect::<Vec<_>>(), vec![1]);

        let token = dsm.to_token();
        assert!(token.embedded);
        let (mut pc, _) = dsm.into_parts();
        pc.set_detached_state(Some(token));
        let rebuilt = DetachedStateManager::from_token(pc, DetachedOptions::default()).unwrap();
        assert!(rebuilt.is_embedded());
        assert!(rebuilt.dirty().contains(1));
    }

    #[test]
    fn test_value_manager_is_read_only() {
        let pc = Record::new(meta()).with("name", "Ann");
        let token = DetachedState {
            oid: None,
            version: None,
            loaded: FieldSet::from_indices(3, [0]),
            dirty: FieldSet::new(3),
            embedded: false,
        };
        let mut dvsm = DetachedValueStateManager::new(&pc, Some(&token));
        let mut tm = TransferFieldManager::new();
        dvsm.provide_loaded(&mut tm).unwrap();
        assert_eq!(tm.take(), Some((0, FieldValue::string("Ann"))));
        assert!(matches!(
            dvsm.store_field(0, FieldValue::Null),
            Err(SteadError::Unsupported { .. })
        ));
        assert!(dvsm
            .setting_field(0, &FieldValue::Null, FieldValue::Null, SetKind::User)
            .is_err());
    }
}
