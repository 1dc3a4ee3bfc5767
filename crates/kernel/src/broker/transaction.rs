//! Transaction demarcation and flush

use super::Broker;
use crate::events::EventKind;
use crate::heap::Instance;
use crate::store::FlushOp;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::Arc;
use stead_core::{
    CascadeOp, CascadePolicy, FieldMetaData, FieldValue, IdKey, Management, ObjectId, Oref,
    SteadError, SteadResult, Version,
};
use stead_lifecycle::{OpenStateManager, PCState, SingleFieldManager, Transition};
use tracing::{debug, warn};

/// What a flush sent for one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flushed {
    Written,
    Removed,
    Checked,
}

impl Broker {
    // =========================================================================
    // Demarcation
    // =========================================================================

    /// Start a transaction.
    ///
    /// Instances changed outside a transaction are enlisted in it.
    pub fn begin(&mut self) -> SteadResult<()> {
        self.check_open()?;
        if self.tx.is_some() {
            return Err(SteadError::invalid_state_recoverable(
                "a transaction is already active",
            ));
        }
        let tx = self.store.begin()?;
        self.tx = Some(tx);
        self.flags.set_active(true);
        for oref in self.heap.managed_orefs() {
            let state = self.sm(oref)?.state();
            if matches!(
                state,
                PCState::NonTransactionalDirty
                    | PCState::NonTransactionalNew
                    | PCState::NonTransactionalDeleted
            ) {
                self.sm_mut(oref)?.transition(Transition::Transactional)?;
            }
        }
        debug!(broker = %self.id, tx = tx.0, "transaction begun");
        Ok(())
    }

    /// Send pending changes to the store without committing
    pub fn flush(&mut self) -> SteadResult<()> {
        self.check_open()?;
        self.require_tx()?;
        self.flush_internal()
    }

    /// Flush and commit. A failed flush or commit rolls the transaction
    /// back before the error is returned.
    pub fn commit(&mut self) -> SteadResult<()> {
        self.check_open()?;
        let tx = self.require_tx()?;
        if let Err(e) = self.flush_internal() {
            self.rollback_after_failure();
            return Err(e);
        }
        let written = match self.store.commit(tx) {
            Ok(written) => written,
            Err(e) => {
                self.rollback_after_failure();
                return Err(e);
            }
        };
        if let Some(cache) = &self.cache {
            cache.evict_all(&written);
        }
        self.tx = None;
        self.flags.set_active(false);
        for oref in self.heap.managed_orefs() {
            self.sm_mut(oref)?.commit()?;
            if self.sm(oref)?.state() == PCState::Transient {
                self.unmanage(oref)?;
            }
        }
        debug!(broker = %self.id, tx = tx.0, rows = written.len(), "transaction committed");
        self.fire_transaction(EventKind::AfterCommit)
    }

    /// Discard the transaction's changes
    pub fn rollback(&mut self) -> SteadResult<()> {
        let tx = self.require_tx()?;
        let store_result = self.store.rollback(tx);
        self.tx = None;
        self.flags.set_active(false);
        for oref in self.heap.managed_orefs() {
            self.sm_mut(oref)?.rollback()?;
            if self.sm(oref)?.state() == PCState::Transient {
                self.unmanage(oref)?;
            }
        }
        debug!(broker = %self.id, tx = tx.0, "transaction rolled back");
        store_result?;
        self.fire_transaction(EventKind::AfterRollback)
    }

    /// Run `f` in a transaction: commit when it returns `Ok`, roll back
    /// when it returns `Err`.
    ///
    /// # Example
    ///
    /// ```text
    /// let oref = broker.transaction(|b| {
    ///     let p = b.insert(person);
    ///     b.persist(p)?;
    ///     Ok(p)
    /// })?;
    /// ```
    pub fn transaction<F, T>(&mut self, f: F) -> SteadResult<T>
    where
        F: FnOnce(&mut Broker) -> SteadResult<T>,
    {
        self.begin()?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                if self.tx.is_some() {
                    self.rollback_after_failure();
                }
                Err(e)
            }
        }
    }

    fn rollback_after_failure(&mut self) {
        if let Err(e) = self.rollback() {
            warn!(broker = %self.id, error = %e, "rollback after failure also failed");
        }
    }

    fn require_tx(&self) -> SteadResult<crate::store::StoreTxId> {
        self.tx
            .ok_or_else(|| SteadError::invalid_state_recoverable("no transaction is active"))
    }

    // =========================================================================
    // Flush
    // =========================================================================

    pub(crate) fn flush_internal(&mut self) -> SteadResult<()> {
        let tx = self.require_tx()?;
        self.resolve_provisional()?;
        self.assign_permanent_ids()?;

        let mut ops = Vec::new();
        let mut flushed: Vec<(Oref, Flushed)> = Vec::new();
        for oref in self.heap.managed_orefs() {
            if let Some((op, kind)) = self.flush_op(oref)? {
                ops.push(op);
                flushed.push((oref, kind));
            }
        }
        if ops.is_empty() {
            return Ok(());
        }
        for &(oref, kind) in &flushed {
            if kind == Flushed::Written {
                self.fire(EventKind::BeforeStore, oref)?;
            }
        }

        let count = ops.len();
        let versions: FxHashMap<ObjectId, Version> =
            self.store.flush(tx, ops)?.into_iter().collect();

        for (oref, kind) in flushed {
            let meta = self.meta_of(oref)?;
            let version = match kind {
                Flushed::Written => {
                    let oid = self.sm(oref)?.object_id().cloned();
                    oid.and_then(|oid| versions.get(&oid).cloned())
                }
                Flushed::Removed | Flushed::Checked => None,
            };
            let sm = self.sm_mut(oref)?;
            sm.after_flush(version.clone())?;
            if let (Some(vf), Some(version)) = (meta.version_field(), version) {
                sm.store_field(vf.index, version.to_field_value(vf.type_code()))?;
            }
            if kind == Flushed::Written {
                self.fire(EventKind::AfterStore, oref)?;
            }
        }
        debug!(broker = %self.id, ops = count, "flushed");
        Ok(())
    }

    /// Confirm provisional instances reachable from persisted roots and
    /// persist unmanaged instances they reach by cascade; drop the rest
    fn resolve_provisional(&mut self) -> SteadResult<()> {
        let mut queue: VecDeque<Oref> = self
            .heap
            .managed_orefs()
            .into_iter()
            .filter(|&oref| {
                self.sm(oref)
                    .map(|sm| {
                        let state = sm.state();
                        state.before_flush() == stead_lifecycle::FlushAction::CascadePersist
                            && !state.is_provisional()
                    })
                    .unwrap_or(false)
            })
            .collect();
        let mut seen: FxHashSet<Oref> = queue.iter().copied().collect();

        while let Some(oref) = queue.pop_front() {
            let meta = self.meta_of(oref)?;
            for fmd in meta.fields() {
                if !fmd.is_relation()
                    || fmd.value.is_embedded_pc()
                    || !self.sm(oref)?.loaded().contains(fmd.index)
                {
                    continue;
                }
                let value = self.sm(oref)?.fetch_field(fmd.index)?;
                let targets = SingleFieldManager::new(fmd, value).gather_cascade(
                    CascadeOp::Persist,
                    &[CascadePolicy::Auto, CascadePolicy::Immediate],
                );
                for target in targets {
                    if !seen.insert(target) {
                        continue;
                    }
                    match self.heap.get(target)? {
                        Instance::Managed(sm) if sm.state().is_provisional() => {
                            self.sm_mut(target)?.transition(Transition::Nonprovisional)?;
                            queue.push_back(target);
                        }
                        Instance::Managed(_) | Instance::Detached(_) => {}
                        Instance::Unmanaged(pc) if pc.detached_state().is_some() => {}
                        Instance::Unmanaged(_) => {
                            let mut visited = FxHashSet::default();
                            self.persist_internal(target, false, &mut visited)?;
                            queue.push_back(target);
                        }
                    }
                }
            }
        }

        for oref in self.heap.managed_orefs() {
            if self.sm(oref)?.state() == PCState::NewProvisional {
                debug!(oref = %oref, "dropping unreachable provisional instance");
                self.unmanage(oref)?;
            }
        }
        Ok(())
    }

    /// Replace temporary ids of new instances with store-assigned ones
    fn assign_permanent_ids(&mut self) -> SteadResult<()> {
        let store = Arc::clone(&self.store);
        for oref in self.heap.managed_orefs() {
            let sm = self.sm(oref)?;
            if sm.state() != PCState::New || sm.owner().is_some() {
                continue;
            }
            let Some(temp) = sm.object_id().filter(|oid| oid.is_temporary()).cloned() else {
                continue;
            };
            let meta = Arc::clone(sm.meta());
            let oid = store
                .assign_object_id(&meta, sm.pc())?
                .ok_or_else(|| {
                    SteadError::user_with(
                        format!("cannot assign an identity to {}: key fields are unset", meta.name()),
                        self.failed(oref),
                    )
                })?;
            if self.by_oid.get(&temp) == Some(&oref) {
                self.by_oid.remove(&temp);
            }
            self.register_oid(oref, oid.clone())?;
            if meta.generated_pk() {
                if let IdKey::Application(values) = oid.key() {
                    for (index, id) in meta.pk_fields().zip(values) {
                        let fmd = meta.require_field(index)?;
                        let value = FieldValue::from_id_value(id, fmd.type_code());
                        self.sm_mut(oref)?.store_field(index, value)?;
                    }
                }
            }
            self.sm_mut(oref)?.set_object_id(Some(oid));
        }
        Ok(())
    }

    /// Store operation for one managed instance, if it has anything to send
    fn flush_op(&self, oref: Oref) -> SteadResult<Option<(FlushOp, Flushed)>> {
        let sm = self.sm(oref)?;
        let state = sm.state();
        if state.is_embedded() || sm.owner().is_some() {
            return Ok(None);
        }
        let Some(oid) = sm.object_id().cloned() else {
            return Ok(None);
        };
        let meta = Arc::clone(sm.meta());
        let version = sm.version().cloned();

        let op = match state {
            PCState::New if !sm.is_flushed_instance() => {
                let mut values = Vec::with_capacity(meta.field_count());
                for fmd in meta.fields() {
                    values.push(if fmd.management == Management::Persistent {
                        self.store_value(oref, fmd, sm.pc().provide_field(fmd.index))?
                    } else {
                        FieldValue::Null
                    });
                }
                (FlushOp::Insert { oid, values }, Flushed::Written)
            }
            PCState::NewFlushedDeleted => (FlushOp::Delete { oid, expected: None }, Flushed::Removed),
            PCState::Deleted => (
                FlushOp::Delete {
                    oid,
                    expected: version,
                },
                Flushed::Removed,
            ),
            PCState::New | PCState::Dirty | PCState::NonTransactionalDirty => {
                let dirty = sm.unflushed_dirty();
                if dirty.is_empty() && !sm.is_version_update_required() {
                    return Ok(None);
                }
                let mut values = Vec::with_capacity(dirty.count());
                for index in dirty.iter() {
                    let fmd = meta.require_field(index)?;
                    if fmd.management != Management::Persistent || fmd.version {
                        continue;
                    }
                    values.push((index, self.store_value(oref, fmd, sm.pc().provide_field(index))?));
                }
                (
                    FlushOp::Update {
                        oid,
                        values,
                        expected: version,
                    },
                    Flushed::Written,
                )
            }
            _ if sm.is_version_check_required() && state.is_persistent() && !state.is_deleted() => {
                match version {
                    Some(expected) => (FlushOp::CheckVersion { oid, expected }, Flushed::Checked),
                    None => return Ok(None),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(op))
    }

    /// Heap form of a value → stored form: handles become object ids and
    /// embedded instances become arrays of their fields
    fn store_value(&self, owner: Oref, fmd: &FieldMetaData, value: FieldValue) -> SteadResult<FieldValue> {
        if fmd.value.is_embedded_pc() {
            let FieldValue::Ref(embedded) = value else {
                return Ok(value);
            };
            let inst = self.heap.get(embedded)?;
            let meta = Arc::clone(inst.meta());
            let mut values = Vec::with_capacity(meta.field_count());
            for efmd in meta.fields() {
                values.push(self.store_value(embedded, efmd, inst.pc().provide_field(efmd.index))?);
            }
            return Ok(FieldValue::Array(values));
        }
        if !fmd.is_relation() {
            return Ok(value);
        }
        value.try_map_refs(&mut |target| self.stored_reference(owner, fmd, target))
    }

    fn stored_reference(&self, owner: Oref, fmd: &FieldMetaData, target: Oref) -> SteadResult<FieldValue> {
        let unusable = |why: &str| {
            SteadError::user_with(
                format!("field {} references an instance that {}", fmd.name, why),
                self.failed(owner),
            )
        };
        match self.heap.get(target) {
            Ok(Instance::Managed(sm)) => {
                if sm.state().is_deleted() {
                    return Err(unusable("was deleted"));
                }
                match sm.object_id() {
                    Some(oid) if !oid.is_temporary() => Ok(FieldValue::ObjectId(oid.clone())),
                    _ => Err(unusable("has no permanent identity")),
                }
            }
            Ok(_) => Err(unusable("is not managed; persist or attach it first")),
            Err(_) => Err(unusable("no longer exists")),
        }
    }
}
