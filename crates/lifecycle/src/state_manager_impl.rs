//! State manager for managed instances
//!
//! [`StateManagerImpl`] is the hub of a managed instance: it owns the
//! instance, its identity and version, the loaded/dirty/flushed bitsets and
//! the current [`PCState`]. It drives every transition through the state
//! machine and applies the effects the machine asks for.
//!
//! Anything that needs the store or other instances (loading, cascading,
//! inverse correction) is the persistence context's job; the context calls
//! in here with the results.

use crate::pc_state::{PCState, StateEffect, Transition, TransitionContext};
use crate::state_manager::{
    ContextFlags, ImplData, ObjectIdAssigner, OpenStateManager, RestoreState, SetKind,
};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::sync::Arc;
use stead_core::{
    ClassMetaData, FieldSet, FieldValue, Management, ObjectId, Oref, PersistenceCapable,
    SteadError, SteadResult, Version,
};
use tracing::debug;

/// State manager of a managed instance
pub struct StateManagerImpl {
    pc: Box<dyn PersistenceCapable>,
    meta: Arc<ClassMetaData>,
    flags: Arc<ContextFlags>,
    oid: Option<ObjectId>,
    version: Option<Version>,
    load_version: Option<Version>,
    state: PCState,
    loaded: FieldSet,
    dirty: FieldSet,
    flushed: FieldSet,
    saved: Option<Vec<Option<FieldValue>>>,
    initial: FxHashMap<usize, FieldValue>,
    flushed_instance: bool,
    version_check: bool,
    version_update: bool,
    owner: Option<(Oref, usize)>,
    impl_data: Option<ImplData>,
    field_impl_data: FxHashMap<usize, ImplData>,
}

impl std::fmt::Debug for StateManagerImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManagerImpl")
            .field("class", &self.meta.name())
            .field("oid", &self.oid)
            .field("state", &self.state)
            .field("version", &self.version)
            .field("loaded", &self.loaded)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl StateManagerImpl {
    /// Manage `pc` starting in `state`
    pub fn new(pc: Box<dyn PersistenceCapable>, flags: Arc<ContextFlags>, state: PCState) -> Self {
        let meta = Arc::clone(pc.meta());
        let n = meta.field_count();
        let mut sm = StateManagerImpl {
            pc,
            meta,
            flags,
            oid: None,
            version: None,
            load_version: None,
            state,
            loaded: FieldSet::new(n),
            dirty: FieldSet::new(n),
            flushed: FieldSet::new(n),
            saved: None,
            initial: FxHashMap::default(),
            flushed_instance: false,
            version_check: false,
            version_update: false,
            owner: None,
            impl_data: None,
            field_impl_data: FxHashMap::default(),
        };
        if state.is_loaded_on_enter() || !state.is_persistent() {
            sm.loaded = FieldSet::full(n);
        }
        sm
    }

    /// Manage an instance known to exist in the store, nothing loaded yet
    pub fn hollow(
        pc: Box<dyn PersistenceCapable>,
        flags: Arc<ContextFlags>,
        oid: ObjectId,
    ) -> Self {
        let mut sm = StateManagerImpl::new(pc, flags, PCState::Hollow);
        sm.loaded = sm.meta.pk_field_set();
        sm.oid = Some(oid);
        sm
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current phase
    pub fn state(&self) -> PCState {
        self.state
    }

    /// Mutable instance access, for the persistence context
    pub fn pc_mut(&mut self) -> &mut dyn PersistenceCapable {
        self.pc.as_mut()
    }

    /// Give up the instance
    pub fn into_pc(self) -> Box<dyn PersistenceCapable> {
        self.pc
    }

    /// Shared transaction flags
    pub fn flags(&self) -> &Arc<ContextFlags> {
        &self.flags
    }

    /// Set the persistent identity
    pub fn set_object_id(&mut self, oid: Option<ObjectId>) {
        self.oid = oid;
    }

    /// Version at load time or at the start of the transaction
    pub fn load_version(&self) -> Option<&Version> {
        self.load_version.as_ref()
    }

    /// Link an embedded instance to its owner
    pub fn set_owner(&mut self, owner: Option<(Oref, usize)>) {
        self.owner = owner;
    }

    /// Whether the instance itself was written to the store this transaction
    pub fn is_flushed_instance(&self) -> bool {
        self.flushed_instance
    }

    /// Dirty fields not yet flushed
    pub fn unflushed_dirty(&self) -> FieldSet {
        let mut set = self.dirty.clone();
        set.difference_with(&self.flushed);
        set
    }

    /// Fields of `wanted` that are not loaded
    pub fn unloaded(&self, wanted: &FieldSet) -> FieldSet {
        let mut set = wanted.clone();
        set.difference_with(&self.loaded);
        set
    }

    /// Value of field `index` at the start of the transaction
    pub fn initial_value(&self, index: usize) -> FieldValue {
        match self.initial.get(&index) {
            Some(v) => v.clone(),
            None => self.pc.provide_field(index),
        }
    }

    /// Request (or cancel) a version check at the next flush
    pub fn set_version_check_required(&mut self, required: bool) {
        self.version_check = required;
    }

    /// Request a version bump at the next flush even without dirty fields
    pub fn set_version_update_required(&mut self, required: bool) {
        self.version_update = required;
    }

    fn transition_context(&self) -> TransitionContext {
        TransitionContext {
            active: self.flags.is_active(),
            flushed: self.flushed_instance,
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Apply `event`, run the entry effect of the resulting phase and return
    /// it so the context can react (e.g. to a release)
    pub fn transition(&mut self, event: Transition) -> SteadResult<StateEffect> {
        let prev = self.state;
        let next = prev
            .transition(event, self.transition_context())
            .map_err(|e| self.tag_error(e))?;
        if next == prev {
            return Ok(StateEffect::None);
        }
        let effect = next.initialize(prev, event);
        debug!(
            class = %self.meta.name(),
            oid = ?self.oid,
            from = %prev,
            to = %next,
            ?event,
            "state transition"
        );
        self.state = next;
        self.apply_effect(effect);
        Ok(effect)
    }

    /// Force a phase without running the state machine
    pub fn set_state(&mut self, state: PCState) {
        self.state = state;
        if state.is_loaded_on_enter() {
            self.loaded = FieldSet::full(self.meta.field_count());
        }
    }

    fn apply_effect(&mut self, effect: StateEffect) {
        match effect {
            StateEffect::None | StateEffect::Release => {}
            StateEffect::ClearFields => self.clear_fields(),
            StateEffect::SaveFields => self.save_fields(),
            StateEffect::RestoreFields => self.restore_fields(),
        }
    }

    fn tag_error(&self, err: SteadError) -> SteadError {
        match err {
            SteadError::InvalidState {
                message,
                failed: None,
                fatal,
            } => SteadError::InvalidState {
                message,
                failed: Some(self.failed_object(None)),
                fatal,
            },
            other => other,
        }
    }

    /// Snapshot loaded fields per the restore policy
    fn save_fields(&mut self) {
        if self.saved.is_some() {
            return;
        }
        let policy = self.flags.restore_state;
        let saved = self
            .meta
            .fields()
            .iter()
            .map(|fmd| {
                let keep = self.loaded.contains(fmd.index)
                    && match policy {
                        RestoreState::None => false,
                        RestoreState::Immutable => !fmd.type_code().is_container(),
                        RestoreState::All => true,
                    };
                keep.then(|| self.pc.provide_field(fmd.index))
            })
            .collect();
        self.saved = Some(saved);
    }

    /// Put saved values back; dirty fields without a saved value are unloaded
    fn restore_fields(&mut self) {
        let saved = self.saved.take().unwrap_or_default();
        for index in self.dirty.clone().iter() {
            match saved.get(index).cloned().flatten() {
                Some(value) => self.pc.replace_field(index, value),
                None => self.unload_field(index),
            }
        }
    }

    /// Unload every non-key field
    fn clear_fields(&mut self) {
        for fmd in self.meta.fields() {
            if !fmd.primary_key {
                self.pc.replace_field(fmd.index, fmd.default_value());
                self.loaded.remove(fmd.index);
            }
        }
        self.dirty.clear();
        self.flushed.clear();
        self.saved = None;
    }

    fn unload_field(&mut self, index: usize) {
        if let Some(fmd) = self.meta.field(index) {
            if !fmd.primary_key {
                self.pc.replace_field(index, fmd.default_value());
                self.loaded.remove(index);
            }
        }
    }

    fn reset_transaction_bookkeeping(&mut self) {
        self.dirty.clear();
        self.flushed.clear();
        self.initial.clear();
        self.saved = None;
        self.flushed_instance = false;
        self.version_check = false;
        self.version_update = false;
    }

    /// Read of field `index` is about to happen. Returns whether the field
    /// must be loaded first.
    pub fn before_read(&mut self, index: usize) -> SteadResult<bool> {
        let active = self.flags.is_active();
        if !active && !self.flags.nontransactional_read && self.state.is_persistent() {
            return Err(SteadError::invalid_state(
                "non-transactional reads are disabled",
                Some(self.failed_object(None)),
            ));
        }
        if self.state == PCState::Hollow || (!self.state.is_transactional() && active) {
            self.transition(Transition::read(active, self.flags.optimistic))?;
        }
        Ok(self.state.is_persistent() && !self.loaded.contains(index))
    }

    /// Mark field `index` dirty, transitioning to a dirty phase first.
    ///
    /// Callers must load the field before dirtying it.
    pub fn dirty(&mut self, index: usize) -> SteadResult<()> {
        let fmd = self.meta.require_field(index)?;
        if fmd.management == Management::None {
            return Ok(());
        }
        let active = self.flags.is_active();
        if !active
            && self.state.is_persistent()
            && !self.state.is_new()
            && !self.flags.nontransactional_write
        {
            return Err(SteadError::invalid_state(
                "non-transactional writes are disabled",
                Some(self.failed_object(None)),
            ));
        }
        self.transition(Transition::write(active, self.flags.optimistic))?;
        self.flushed.remove(index);
        self.loaded.insert(index);
        self.dirty.insert(index);
        Ok(())
    }

    /// Merge values read from the store. Dirty fields keep their in-memory
    /// values. The version is adopted when none is known yet.
    pub fn load(&mut self, values: Vec<(usize, FieldValue)>, version: Option<Version>) {
        for (index, value) in values {
            if index >= self.meta.field_count() || self.dirty.contains(index) {
                continue;
            }
            self.pc.replace_field(index, value);
            self.loaded.insert(index);
        }
        if self.version.is_none() {
            self.version = version.clone();
            self.load_version = version;
        }
    }

    /// Changes were sent to the store; adopt the store's new version
    pub fn after_flush(&mut self, new_version: Option<Version>) -> SteadResult<()> {
        self.flushed.union_with(&self.dirty);
        self.transition(Transition::Flush)?;
        self.flushed_instance = true;
        self.version_check = false;
        self.version_update = false;
        if new_version.is_some() {
            self.version = new_version;
        }
        Ok(())
    }

    /// End of transaction: commit
    pub fn commit(&mut self) -> SteadResult<StateEffect> {
        let event = if self.flags.retain_state {
            Transition::CommitRetain
        } else {
            Transition::Commit
        };
        let effect = self.transition(event)?;
        self.reset_transaction_bookkeeping();
        self.load_version = self.version.clone();
        Ok(effect)
    }

    /// End of transaction: rollback
    pub fn rollback(&mut self) -> SteadResult<StateEffect> {
        let event = if self.flags.restore_state == RestoreState::None {
            Transition::Rollback
        } else {
            Transition::RollbackRestore
        };
        self.version = self.load_version.clone();
        let effect = self.transition(event)?;
        self.reset_transaction_bookkeeping();
        Ok(effect)
    }

    /// Drop loaded state so the next access reloads it
    pub fn evict(&mut self) -> SteadResult<StateEffect> {
        self.transition(Transition::Evict)
    }

    /// Refresh: discard changes and unload everything but keys
    pub fn refresh(&mut self) -> SteadResult<()> {
        if self.state.is_new() {
            return Ok(());
        }
        self.transition(Transition::Refresh)?;
        self.clear_fields();
        self.version = None;
        self.load_version = None;
        Ok(())
    }
}

impl OpenStateManager for StateManagerImpl {
    fn manager_name(&self) -> &'static str {
        "StateManagerImpl"
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

    fn assign_object_id(&mut self, assigner: &mut dyn ObjectIdAssigner) -> SteadResult<bool> {
        if matches!(&self.oid, Some(oid) if !oid.is_temporary()) {
            return Ok(true);
        }
        match assigner.assign(&self.meta, self.pc.as_ref())? {
            Some(oid) => {
                self.oid = Some(oid);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    fn set_version(&mut self, version: Option<Version>) -> SteadResult<()> {
        if self.load_version.is_none() {
            self.load_version = version.clone();
        }
        self.version = version;
        Ok(())
    }

    fn pc_state(&self) -> Option<PCState> {
        Some(self.state)
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
        self.owner
    }

    fn is_detached(&self) -> bool {
        false
    }

    fn is_flushed(&self) -> bool {
        self.flushed_instance
    }

    fn is_version_check_required(&self) -> bool {
        self.version_check || self.state.is_version_check_required(self.flushed_instance)
    }

    fn is_version_update_required(&self) -> bool {
        self.version_update || (self.state.is_dirty() && !self.state.is_deleted())
    }

    fn accessing_field(&self, index: usize) -> SteadResult<()> {
        self.meta.require_field(index)?;
        if !self.flags.is_active()
            && !self.flags.nontransactional_read
            && self.state.is_persistent()
            && !self.loaded.contains(index)
        {
            return Err(SteadError::invalid_state(
                "non-transactional reads are disabled",
                Some(self.failed_object(None)),
            ));
        }
        Ok(())
    }

    fn fetch_field(&self, index: usize) -> SteadResult<FieldValue> {
        self.meta.require_field(index)?;
        Ok(self.pc.provide_field(index))
    }

    fn store_field(&mut self, index: usize, value: FieldValue) -> SteadResult<()> {
        self.meta.require_field(index)?;
        self.pc.replace_field(index, value);
        self.loaded.insert(index);
        Ok(())
    }

    fn setting_field(
        &mut self,
        index: usize,
        current: &FieldValue,
        next: FieldValue,
        kind: SetKind,
    ) -> SteadResult<bool> {
        let fmd = self.meta.require_field(index)?;
        let relation = fmd.is_relation();
        if self.loaded.contains(index) && *current == next && kind != SetKind::Restore {
            return Ok(false);
        }
        if !self.state.is_persistent() && !self.state.is_transactional() {
            self.pc.replace_field(index, next);
            return Ok(true);
        }
        if relation && !self.initial.contains_key(&index) && !self.state.is_new() {
            self.initial.insert(index, current.clone());
        }
        self.dirty(index)?;
        self.pc.replace_field(index, next);
        Ok(true)
    }

    fn dirty_field(&mut self, index: usize) -> SteadResult<()> {
        self.dirty(index)
    }

    fn impl_data(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.impl_data.as_deref()
    }

    fn set_impl_data(&mut self, data: Option<ImplData>) -> SteadResult<Option<ImplData>> {
        Ok(std::mem::replace(&mut self.impl_data, data))
    }

    fn field_impl_data(&self, index: usize) -> Option<&(dyn Any + Send + Sync)> {
        self.field_impl_data.get(&index).map(|d| d.as_ref())
    }

    fn set_field_impl_data(
        &mut self,
        index: usize,
        data: Option<ImplData>,
    ) -> SteadResult<Option<ImplData>> {
        self.meta.require_field(index)?;
        Ok(match data {
            Some(d) => self.field_impl_data.insert(index, d),
            None => self.field_impl_data.remove(&index),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_manager::TransferFieldManager;
    use stead_core::{FieldMetaData, Record, TypeCode};

    fn meta() -> Arc<ClassMetaData> {
        ClassMetaData::builder("Person")
            .field(FieldMetaData::new("id", TypeCode::Long).primary_key())
            .field(FieldMetaData::new("name", TypeCode::String))
            .field(FieldMetaData::new("age", TypeCode::Int))
            .field(FieldMetaData::new("tags", TypeCode::Collection))
            .build()
            .unwrap()
    }

    fn flags(restore: RestoreState) -> Arc<ContextFlags> {
        let flags = ContextFlags::new(true, true, true, true, restore);
        flags.set_active(true);
        flags
    }

    fn clean(restore: RestoreState) -> StateManagerImpl {
        let pc = Record::new(meta()).with("id", 1i64).with("name", "Ann").with("age", 30);
        let mut sm = StateManagerImpl::hollow(
            Box::new(pc),
            flags(restore),
            ObjectId::datastore("Person", 1),
        );
        sm.load(
            vec![(1, "Ann".into()), (2, 30.into()), (3, FieldValue::list(vec![]))],
            Some(Version::Counter(1)),
        );
        sm.before_read(1).unwrap();
        sm
    }

    #[test]
    fn test_hollow_has_only_keys_loaded() {
        let sm = StateManagerImpl::hollow(
            Box::new(Record::new(meta())),
            flags(RestoreState::All),
            ObjectId::datastore("Person", 1),
        );
        assert_eq!(sm.loaded().iter().collect::<Vec<_>>(), vec![0]);
        assert_eq!(sm.state(), PCState::Hollow);
    }

    #[test]
    fn test_read_moves_hollow_to_nontransactional_when_optimistic() {
        let sm = clean(RestoreState::All);
        assert_eq!(sm.state(), PCState::NonTransactional);
        assert_eq!(sm.version(), Some(&Version::Counter(1)));
    }

    #[test]
    fn test_setting_field_marks_dirty() {
        let mut sm = clean(RestoreState::All);
        let cur = sm.fetch_field(2).unwrap();
        assert!(sm.setting_field(2, &cur, 31.into(), SetKind::User).unwrap());
        assert_eq!(sm.state(), PCState::Dirty);
        assert_eq!(sm.dirty().iter().collect::<Vec<_>>(), vec![2]);
        assert!(sm.dirty().is_subset(sm.loaded()));
        assert_eq!(sm.fetch_field(2).unwrap(), FieldValue::Int(31));
    }

    #[test]
    fn test_setting_same_value_is_noop() {
        let mut sm = clean(RestoreState::All);
        let cur = sm.fetch_field(1).unwrap();
        assert!(!sm.setting_field(1, &cur, "Ann".into(), SetKind::User).unwrap());
        assert!(sm.dirty().is_empty());
    }

    #[test]
    fn test_rollback_restores_saved_values() {
        let mut sm = clean(RestoreState::Immutable);
        let cur = sm.fetch_field(2).unwrap();
        sm.setting_field(2, &cur, 99.into(), SetKind::User).unwrap();
        let tags = sm.fetch_field(3).unwrap();
        sm.setting_field(3, &tags, FieldValue::list(vec!["x".into()]), SetKind::User)
            .unwrap();
        sm.rollback().unwrap();
        assert_eq!(sm.state(), PCState::NonTransactional);
        assert_eq!(sm.fetch_field(2).unwrap(), FieldValue::Int(30));
        assert!(!sm.loaded().contains(3));
        assert!(sm.dirty().is_empty());
    }

    #[test]
    fn test_rollback_without_restore_hollows() {
        let mut sm = clean(RestoreState::None);
        let cur = sm.fetch_field(2).unwrap();
        sm.setting_field(2, &cur, 99.into(), SetKind::User).unwrap();
        sm.rollback().unwrap();
        assert_eq!(sm.state(), PCState::Hollow);
        assert_eq!(sm.loaded().iter().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_flush_then_commit() {
        let mut sm = clean(RestoreState::All);
        let cur = sm.fetch_field(2).unwrap();
        sm.setting_field(2, &cur, 31.into(), SetKind::User).unwrap();
        assert!(sm.is_version_check_required());
        assert_eq!(sm.unflushed_dirty().count(), 1);
        sm.after_flush(Some(Version::Counter(2))).unwrap();
        assert!(sm.unflushed_dirty().is_empty());
        assert!(!sm.is_version_check_required());
        sm.commit().unwrap();
        assert_eq!(sm.state(), PCState::NonTransactional);
        assert_eq!(sm.version(), Some(&Version::Counter(2)));
        assert_eq!(sm.load_version(), Some(&Version::Counter(2)));
        assert!(sm.flushed().is_empty());
    }

    #[test]
    fn test_write_deleted_fails_with_failed_object() {
        let mut sm = clean(RestoreState::All);
        sm.transition(Transition::Delete).unwrap();
        let cur = sm.fetch_field(2).unwrap();
        let err = sm.setting_field(2, &cur, 1.into(), SetKind::User).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.failed_objects().len(), 1);
    }

    #[test]
    fn test_nontransactional_write_disabled() {
        let flags = ContextFlags::new(true, true, false, true, RestoreState::All);
        let mut sm = StateManagerImpl::hollow(
            Box::new(Record::new(meta())),
            flags,
            ObjectId::datastore("Person", 1),
        );
        sm.load(vec![(2, 1.into())], Some(Version::Counter(1)));
        let err = sm.setting_field(2, &FieldValue::Int(1), 2.into(), SetKind::User);
        assert!(err.is_err());
    }

    #[test]
    fn test_provide_and_replace_through_transfer() {
        let sm = clean(RestoreState::All);
        let mut other = StateManagerImpl::new(
            Box::new(Record::new(meta())),
            flags(RestoreState::All),
            PCState::Transient,
        );
        let mut tm = TransferFieldManager::new();
        sm.provide_field(&mut tm, 1).unwrap();
        other.replace_field(&mut tm, 1).unwrap();
        assert_eq!(other.fetch_field(1).unwrap(), FieldValue::string("Ann"));
    }

    #[test]
    fn test_impl_data_slots() {
        let mut sm = clean(RestoreState::All);
        assert!(sm.impl_data().is_none());
        sm.set_impl_data(Some(Box::new(5u32))).unwrap();
        assert_eq!(sm.impl_data().and_then(|d| d.downcast_ref::<u32>()), Some(&5));
        sm.set_field_impl_data(1, Some(Box::new("x"))).unwrap();
        assert!(sm.field_impl_data(1).is_some());
        assert!(sm.set_field_impl_data(99, None).is_err());
    }

    #[test]
    fn test_relation_initial_value_recorded() {
        let m = ClassMetaData::builder("A")
            .field(FieldMetaData::relation("b", "B"))
            .build()
            .unwrap();
        let mut sm = StateManagerImpl::hollow(
            Box::new(Record::new(m)),
            flags(RestoreState::All),
            ObjectId::datastore("A", 1),
        );
        let b1 = Oref::new(1, 0);
        sm.load(vec![(0, b1.into())], Some(Version::Counter(1)));
        sm.setting_field(0, &b1.into(), Oref::new(2, 0).into(), SetKind::User)
            .unwrap();
        assert_eq!(sm.initial_value(0), FieldValue::Ref(b1));
    }
}
