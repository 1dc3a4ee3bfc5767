//! Persist, delete, find and the smaller lifecycle operations

use super::Broker;
use crate::events::EventKind;
use crate::heap::Instance;
use crate::store::StoreManager;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use stead_core::{
    CascadeOp, CascadePolicy, ClassMetaData, FieldValue, IdKey, IdentityType, ObjectId, Oref,
    PersistenceCapable, Record, SteadError, SteadResult,
};
use stead_lifecycle::{
    ObjectIdAssigner, OpenStateManager, PCState, SingleFieldManager, StateManagerImpl, Transition,
};
use tracing::debug;

/// Assigns permanent ids through the store
pub(crate) struct StoreAssigner<'a> {
    pub(crate) store: &'a dyn StoreManager,
}

impl ObjectIdAssigner for StoreAssigner<'_> {
    fn assign(
        &mut self,
        meta: &ClassMetaData,
        pc: &dyn PersistenceCapable,
    ) -> SteadResult<Option<ObjectId>> {
        self.store.assign_object_id(meta, pc)
    }
}

impl Broker {
    // =========================================================================
    // Persist
    // =========================================================================

    /// Make an instance persistent. Relations with an `Immediate` persist
    /// cascade are persisted now; `Auto` ones provisionally, confirmed at
    /// flush if still reachable.
    pub fn persist(&mut self, oref: Oref) -> SteadResult<()> {
        self.check_open()?;
        let mut visited = FxHashSet::default();
        self.persist_internal(oref, false, &mut visited)
    }

    /// Persist several instances, collecting failures
    pub fn persist_all(&mut self, orefs: &[Oref]) -> SteadResult<()> {
        self.check_open()?;
        let mut visited = FxHashSet::default();
        let mut errors = Vec::new();
        for &oref in orefs {
            if let Err(e) = self.persist_internal(oref, false, &mut visited) {
                errors.push(e);
            }
        }
        match SteadError::collect("persist failed", errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn persist_internal(
        &mut self,
        oref: Oref,
        provisional: bool,
        visited: &mut FxHashSet<Oref>,
    ) -> SteadResult<()> {
        if !visited.insert(oref) {
            return Ok(());
        }
        let meta = self.meta_of(oref)?;
        if meta.embedded_only() {
            return Err(SteadError::user_with(
                format!("class {} can only be embedded", meta.name()),
                self.failed(oref),
            ));
        }
        match self.heap.get(oref)? {
            Instance::Managed(sm) => {
                let state = sm.state();
                if state.is_deleted() {
                    self.sm_mut(oref)?.transition(Transition::Persist)?;
                } else if state.is_provisional() && !provisional {
                    self.sm_mut(oref)?.transition(Transition::Nonprovisional)?;
                } else if !state.is_persistent() && !state.is_embedded() {
                    self.fire(EventKind::BeforePersist, oref)?;
                    self.make_persistent(oref, provisional)?;
                    self.fire(EventKind::AfterPersist, oref)?;
                }
            }
            Instance::Detached(_) => return Err(self.detached_error(oref, "persist")),
            Instance::Unmanaged(pc) => {
                if pc.detached_state().is_some() {
                    return Err(self.detached_error(oref, "persist"));
                }
                self.fire(EventKind::BeforePersist, oref)?;
                let pc = match self.heap.take(oref)? {
                    Instance::Unmanaged(pc) => pc,
                    other => {
                        self.heap.put(oref, other)?;
                        return Err(SteadError::internal("instance changed during persist"));
                    }
                };
                let sm = StateManagerImpl::new(pc, Arc::clone(&self.flags), PCState::Transient);
                self.heap.put(oref, Instance::Managed(Box::new(sm)))?;
                if let Err(e) = self.make_persistent(oref, provisional) {
                    self.unmanage(oref)?;
                    return Err(e);
                }
                self.fire(EventKind::AfterPersist, oref)?;
            }
        }
        self.embed_fields(oref)?;
        self.cascade_persist(oref, visited)
    }

    /// Transient managed instance → new, with an identity
    fn make_persistent(&mut self, oref: Oref, provisional: bool) -> SteadResult<()> {
        let event = if self.flags.is_active() {
            Transition::Persist
        } else {
            Transition::PersistNontransactional
        };
        self.sm_mut(oref)?.transition(event)?;
        if provisional && self.sm(oref)?.state() == PCState::New {
            self.sm_mut(oref)?.set_state(PCState::NewProvisional);
        }

        let meta = self.meta_of(oref)?;
        let store = Arc::clone(&self.store);
        let permanent = meta.identity() == IdentityType::Application
            && !meta.generated_pk()
            && self
                .sm_mut(oref)?
                .assign_object_id(&mut StoreAssigner { store: store.as_ref() })?;
        if !permanent {
            let temp = self.next_temporary_id(meta.name());
            self.sm_mut(oref)?.set_object_id(Some(temp));
        }
        let oid = self
            .sm(oref)?
            .object_id()
            .cloned()
            .ok_or_else(|| SteadError::internal("persisted instance without identity"))?;
        self.register_oid(oref, oid)
    }

    /// Index `oid` → `oref`; a live instance already holding `oid` is an error
    pub(crate) fn register_oid(&mut self, oref: Oref, oid: ObjectId) -> SteadResult<()> {
        if let Some(&existing) = self.by_oid.get(&oid) {
            let live = existing != oref
                && matches!(self.heap.get(existing), Ok(Instance::Managed(sm)) if !sm.state().is_deleted());
            if live {
                return Err(SteadError::user_with(
                    format!("an instance with id {} is already managed", oid),
                    self.failed(oref),
                ));
            }
        }
        self.by_oid.insert(oid, oref);
        Ok(())
    }

    fn cascade_persist(&mut self, oref: Oref, visited: &mut FxHashSet<Oref>) -> SteadResult<()> {
        let meta = self.meta_of(oref)?;
        for fmd in meta.fields() {
            if !fmd.is_relation() || fmd.value.is_embedded_pc() {
                continue;
            }
            let policy = fmd.cascade_policy(CascadeOp::Persist);
            if !policy.cascades() || !self.sm(oref)?.loaded().contains(fmd.index) {
                continue;
            }
            let value = self.sm(oref)?.fetch_field(fmd.index)?;
            for target in SingleFieldManager::new(fmd, value).gather_cascade(
                CascadeOp::Persist,
                &[CascadePolicy::Auto, CascadePolicy::Immediate],
            ) {
                let provisional = policy == CascadePolicy::Auto;
                self.persist_internal(target, provisional, visited)?;
            }
        }
        Ok(())
    }

    /// Bring the embedded values of a managed instance under management
    fn embed_fields(&mut self, oref: Oref) -> SteadResult<()> {
        let meta = self.meta_of(oref)?;
        for fmd in meta.fields() {
            if !fmd.value.is_embedded_pc() {
                continue;
            }
            if let FieldValue::Ref(value) = self.sm(oref)?.fetch_field(fmd.index)? {
                let embedded = self.embed(oref, fmd.index, value)?;
                if embedded != value {
                    self.sm_mut(oref)?.store_field(fmd.index, FieldValue::Ref(embedded))?;
                }
            }
        }
        Ok(())
    }

    /// Manage `value` as the embedded value of field `field` of `owner`.
    /// A value already embedded elsewhere is copied. Returns the managed
    /// embedded instance.
    pub fn embed(&mut self, owner: Oref, field: usize, value: Oref) -> SteadResult<Oref> {
        self.check_open()?;
        let owner_meta = self.meta_of(owner)?;
        let fmd = owner_meta.require_field(field)?;
        if !fmd.value.is_embedded_pc() {
            return Err(SteadError::user(format!(
                "field {}.{} does not hold an embedded value",
                owner_meta.name(),
                fmd.name
            )));
        }
        let state = if self.flags.is_active() {
            PCState::EmbeddedClean
        } else {
            PCState::EmbeddedNonTransactional
        };
        let embedded = match self.heap.get(value)? {
            Instance::Managed(sm) if sm.owner() == Some((owner, field)) => return Ok(value),
            Instance::Unmanaged(pc) if pc.detached_state().is_none() => {
                let pc = match self.heap.take(value)? {
                    Instance::Unmanaged(pc) => pc,
                    other => {
                        self.heap.put(value, other)?;
                        return Err(SteadError::internal("instance changed during embed"));
                    }
                };
                let mut sm = StateManagerImpl::new(pc, Arc::clone(&self.flags), state);
                sm.set_owner(Some((owner, field)));
                self.heap.put(value, Instance::Managed(Box::new(sm)))?;
                value
            }
            other => {
                let copy = other.pc().copy_fields();
                let mut sm = StateManagerImpl::new(copy, Arc::clone(&self.flags), state);
                sm.set_owner(Some((owner, field)));
                self.heap.insert(Instance::Managed(Box::new(sm)))
            }
        };
        self.embed_fields(embedded)?;
        Ok(embedded)
    }

    fn detached_error(&self, oref: Oref, op: &str) -> SteadError {
        SteadError::user_with(
            format!("cannot {} a detached instance; attach it instead", op),
            self.failed(oref),
        )
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete a managed instance and its dependents
    pub fn delete(&mut self, oref: Oref) -> SteadResult<()> {
        self.check_open()?;
        let mut visited = FxHashSet::default();
        self.delete_internal(oref, &mut visited)
    }

    fn delete_internal(&mut self, oref: Oref, visited: &mut FxHashSet<Oref>) -> SteadResult<()> {
        if !visited.insert(oref) {
            return Ok(());
        }
        match self.heap.get(oref)? {
            Instance::Managed(sm) if sm.state().is_deleted() => return Ok(()),
            Instance::Managed(_) => {}
            Instance::Detached(_) => return Err(self.detached_error(oref, "delete")),
            Instance::Unmanaged(_) => {
                return Err(SteadError::user_with(
                    "cannot delete an instance that is not persistent",
                    self.failed(oref),
                ))
            }
        }
        self.fire(EventKind::BeforeDelete, oref)?;

        // dependents must be known before the instance leaves the graph
        let meta = self.meta_of(oref)?;
        let cascading = meta
            .fields()
            .iter()
            .filter(|f| f.is_relation() && f.cascade_policy(CascadeOp::Delete).cascades())
            .map(|f| f.index);
        let wanted = stead_core::FieldSet::from_indices(meta.field_count(), cascading);
        self.load_fields(oref, &wanted)?;

        self.sm_mut(oref)?.transition(Transition::Delete)?;
        self.fire(EventKind::AfterDelete, oref)?;

        let mut dependents = Vec::new();
        for fmd in meta.fields() {
            if !fmd.is_relation() {
                continue;
            }
            let value = self.sm(oref)?.fetch_field(fmd.index)?;
            if fmd.value.is_embedded_pc() {
                dependents.extend(value.refs());
            } else {
                dependents.extend(SingleFieldManager::new(fmd, value).dependents());
            }
        }
        if self.sm(oref)?.state() == PCState::Transient {
            self.unmanage(oref)?;
        }
        for dependent in dependents {
            if self.is_managed(dependent) {
                self.delete_internal(dependent, visited)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Find
    // =========================================================================

    /// Managed instance for `oid`, loading it from the store if needed.
    /// `None` when no such row exists or the instance was deleted.
    pub fn find(&mut self, oid: &ObjectId) -> SteadResult<Option<Oref>> {
        self.check_open()?;
        if let Some(&oref) = self.by_oid.get(oid) {
            let state = self.sm(oref)?.state();
            if state.is_deleted() {
                return Ok(None);
            }
            if state == PCState::Hollow {
                let meta = self.meta_of(oref)?;
                let fields = self.fetch.fields_for(&meta);
                self.load_fields(oref, &fields)?;
                self.after_load_transition(oref)?;
            }
            return Ok(Some(oref));
        }
        let Some(row) = self.load_row(oid)? else {
            return Ok(None);
        };
        let oref = self.hollow(oid)?;
        let meta = self.meta_of(oref)?;
        let fields = self.fetch.fields_for(&meta);
        self.apply_row(oref, row, &fields)?;
        self.after_load_transition(oref)?;
        self.fire(EventKind::AfterLoad, oref)?;
        debug!(oid = %oid, oref = %oref, "instance loaded");
        Ok(Some(oref))
    }

    /// Managed instance for `oid` if this context already holds one
    pub fn find_cached(&self, oid: &ObjectId) -> Option<Oref> {
        self.by_oid
            .get(oid)
            .copied()
            .filter(|&oref| matches!(self.heap.get(oref), Ok(Instance::Managed(sm)) if !sm.state().is_deleted()))
    }

    /// Managed instance for `oid` without touching the store; a hollow
    /// instance is created when none is held
    pub fn get_reference(&mut self, oid: &ObjectId) -> SteadResult<Oref> {
        self.check_open()?;
        match self.by_oid.get(oid) {
            Some(&oref) => Ok(oref),
            None => self.hollow(oid),
        }
    }

    fn hollow(&mut self, oid: &ObjectId) -> SteadResult<Oref> {
        let meta = Arc::clone(self.metadata.require(oid.class())?);
        let mut pc = Record::new(Arc::clone(&meta));
        if let IdKey::Application(values) = oid.key() {
            for (index, id) in meta.pk_fields().zip(values) {
                if let Some(fmd) = meta.field(index) {
                    pc.replace_field(index, FieldValue::from_id_value(id, fmd.type_code()));
                }
            }
        }
        let sm = StateManagerImpl::hollow(Box::new(pc), Arc::clone(&self.flags), oid.clone());
        let oref = self.heap.insert(Instance::Managed(Box::new(sm)));
        self.by_oid.insert(oid.clone(), oref);
        Ok(oref)
    }

    fn after_load_transition(&mut self, oref: Oref) -> SteadResult<()> {
        let event = Transition::read(self.flags.is_active(), self.flags.optimistic);
        self.sm_mut(oref)?.transition(event)?;
        Ok(())
    }

    // =========================================================================
    // Smaller lifecycle operations
    // =========================================================================

    /// Enlist an instance in the current transaction. Unmanaged instances
    /// become transactional-transient.
    pub fn transactional(&mut self, oref: Oref) -> SteadResult<()> {
        self.check_open()?;
        if let Instance::Unmanaged(pc) = self.heap.get(oref)? {
            if pc.detached_state().is_some() {
                return Err(self.detached_error(oref, "enlist"));
            }
            let pc = match self.heap.take(oref)? {
                Instance::Unmanaged(pc) => pc,
                other => {
                    self.heap.put(oref, other)?;
                    return Err(SteadError::internal("instance changed during enlist"));
                }
            };
            let sm = StateManagerImpl::new(pc, Arc::clone(&self.flags), PCState::Transient);
            self.heap.put(oref, Instance::Managed(Box::new(sm)))?;
        }
        self.sm_mut(oref)?.transition(Transition::Transactional)?;
        Ok(())
    }

    /// Remove an instance from the current transaction
    pub fn nontransactional(&mut self, oref: Oref) -> SteadResult<()> {
        self.check_open()?;
        self.sm_mut(oref)?.transition(Transition::Nontransactional)?;
        if self.sm(oref)?.state() == PCState::Transient {
            self.unmanage(oref)?;
        }
        Ok(())
    }

    /// Drop the loaded state of a clean instance
    pub fn evict(&mut self, oref: Oref) -> SteadResult<()> {
        self.check_open()?;
        self.sm_mut(oref)?.evict()?;
        Ok(())
    }

    /// Evict every managed instance that allows it
    pub fn evict_all(&mut self) -> SteadResult<()> {
        self.check_open()?;
        for oref in self.heap.managed_orefs() {
            self.sm_mut(oref)?.evict()?;
        }
        Ok(())
    }

    /// Stop managing an unchanged instance; it stays in the heap unmanaged
    pub fn release(&mut self, oref: Oref) -> SteadResult<()> {
        self.check_open()?;
        self.sm_mut(oref)?.transition(Transition::Release)?;
        self.unmanage(oref)
    }

    /// Discard changes and reload from the store, cascading over `Immediate`
    /// refresh relations
    pub fn refresh(&mut self, oref: Oref) -> SteadResult<()> {
        self.check_open()?;
        let mut visited = FxHashSet::default();
        self.refresh_internal(oref, &mut visited)
    }

    fn refresh_internal(&mut self, oref: Oref, visited: &mut FxHashSet<Oref>) -> SteadResult<()> {
        if !visited.insert(oref) {
            return Ok(());
        }
        let state = self.sm(oref)?.state();
        if state.is_new() || !state.is_persistent() || state.is_deleted() {
            return Ok(());
        }
        self.sm_mut(oref)?.refresh()?;
        let meta = self.meta_of(oref)?;
        let fields = self.fetch.fields_for(&meta);
        self.load_fields(oref, &fields)?;
        for fmd in meta.fields() {
            if fmd.cascade_policy(CascadeOp::Refresh) != CascadePolicy::Immediate
                || !self.sm(oref)?.loaded().contains(fmd.index)
            {
                continue;
            }
            let value = self.sm(oref)?.fetch_field(fmd.index)?;
            for target in SingleFieldManager::new(fmd, value)
                .gather_cascade(CascadeOp::Refresh, &[CascadePolicy::Immediate])
            {
                if self.is_managed(target) {
                    self.refresh_internal(target, visited)?;
                }
            }
        }
        Ok(())
    }
}
