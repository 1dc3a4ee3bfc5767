//! Graph attachment
//!
//! [`AttachManager`] merges detached copies (and brand-new instances) back
//! into a broker. For each instance an [`AttachStrategy`] decides identity,
//! version and which fields to copy; the manager then:
//!
//! 1. finds or creates the managed counterpart,
//! 2. rejects stale copies whose version conflicts with the managed one,
//! 3. copies fields through the normal write path so only real changes
//!    dirty the managed instance,
//! 4. follows relations whose attach cascade applies.
//!
//! Every detached instance reached during one call is recorded in a
//! [`VisitArena`] before its fields are copied, so cycles map onto a single
//! managed instance per original.

mod strategy;

pub use strategy::{AttachStrategy, CopyMode, DetachedStateAttachStrategy, VersionAttachStrategy};

use crate::broker::Broker;
use crate::events::{EventKind, OpActions, OpCallbacks};
use crate::heap::Instance;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use stead_core::{
    CascadeOp, ClassMetaData, FailedObject, FieldMetaData, FieldValue, Oref, SteadError,
    SteadResult, VersionOrdering, VisitArena,
};
use stead_lifecycle::{OpenStateManager, SetKind};
use tracing::{debug, warn};

/// Attaches instances for one top-level operation
pub(crate) struct AttachManager<'a> {
    broker: &'a mut Broker,
    callbacks: Option<&'a dyn OpCallbacks>,
    arena: VisitArena,
    fail_fast: bool,
}

impl<'a> AttachManager<'a> {
    pub(crate) fn new(broker: &'a mut Broker, callbacks: Option<&'a dyn OpCallbacks>) -> Self {
        let fail_fast = broker.config.callbacks.fail_fast;
        AttachManager {
            broker,
            callbacks,
            arena: VisitArena::new(),
            fail_fast,
        }
    }

    /// Attach one instance; returns the managed counterpart
    pub(crate) fn attach(mut self, oref: Oref) -> SteadResult<Oref> {
        let managed = self.attach_internal(oref)?;
        debug!(root = %oref, managed = %managed, attached = self.arena.len(), "attached");
        Ok(managed)
    }

    /// Attach several instances. Failures are collected unless fail-fast is
    /// configured.
    pub(crate) fn attach_all(mut self, orefs: &[Oref]) -> SteadResult<Vec<Oref>> {
        let mut managed = Vec::with_capacity(orefs.len());
        let mut errors = Vec::new();
        for &oref in orefs {
            match self.attach_internal(oref) {
                Ok(m) => managed.push(m),
                Err(e) if self.fail_fast => return Err(e),
                Err(e) => {
                    warn!(oref = %oref, error = %e, "attach failed; continuing");
                    errors.push(e);
                }
            }
        }
        debug!(roots = orefs.len(), attached = self.arena.len(), failures = errors.len(), "attached all");
        match SteadError::collect("attach failed", errors) {
            Some(err) => Err(err),
            None => Ok(managed),
        }
    }

    fn actions(&self, oref: Oref) -> OpActions {
        self.callbacks
            .map(|c| c.process_argument(CascadeOp::Attach, oref))
            .unwrap_or(OpActions::ALL)
    }

    fn attach_internal(&mut self, oref: Oref) -> SteadResult<Oref> {
        if let Some(managed) = self.arena.produced(oref) {
            return Ok(managed);
        }
        if self.broker.is_managed(oref) {
            return self.attach_managed(oref);
        }
        let actions = self.actions(oref);
        if !actions.run {
            return Ok(oref);
        }

        let strategy = strategy::strategy_for(self.broker, oref)?;
        let meta = self.broker.meta_of(oref)?;
        let is_new = match strategy.object_id() {
            None => true,
            Some(oid) if strategy.identity_inferred() => {
                self.broker.find_cached(oid).is_none()
                    && !self.broker.store.exists(self.broker.tx, oid)?
            }
            Some(_) => false,
        };
        if is_new {
            return self.attach_new(oref, strategy.as_ref(), &meta, actions.cascade);
        }

        let oid = strategy
            .object_id()
            .cloned()
            .ok_or_else(|| SteadError::internal("attached instance lost its identity"))?;
        let Some(managed) = self.broker.find(&oid)? else {
            let failed = FailedObject::new(meta.name(), Some(oref), Some(oid.clone()));
            return Err(if strategy.version().is_some() {
                SteadError::optimistic("attached instance was deleted concurrently", failed)
            } else {
                SteadError::ObjectNotFound { oid }
            });
        };
        self.arena.record(oref, managed);
        self.broker.fire_event(EventKind::BeforeAttach, oref, Some(managed))?;

        if let Some(detached) = strategy.version() {
            let current = self.broker.sm(managed)?.version().cloned();
            let ordering = match &current {
                Some(current) => self.broker.store.compare_version(detached, current),
                None => VersionOrdering::Later,
            };
            match ordering {
                VersionOrdering::Same => {}
                VersionOrdering::Later => self.adopt_version(managed, &meta, detached.clone())?,
                VersionOrdering::Earlier | VersionOrdering::Different => {
                    return Err(SteadError::optimistic(
                        format!(
                            "attached version {} conflicts with current version {}",
                            detached,
                            current.map(|v| v.to_string()).unwrap_or_default()
                        ),
                        self.broker.failed(managed),
                    ));
                }
            }
        }

        self.copy_fields(oref, managed, strategy.as_ref(), &meta, actions.cascade)?;
        if !strategy.dirty().is_empty() {
            self.broker.sm_mut(managed)?.set_version_check_required(true);
        }
        self.broker.fire_event(EventKind::AfterAttach, managed, Some(oref))?;
        debug!(oref = %oref, managed = %managed, strategy = strategy.name(), "instance attached");
        Ok(managed)
    }

    /// An instance already managed here attaches to itself; its cascading
    /// relations may still point at detached copies
    fn attach_managed(&mut self, oref: Oref) -> SteadResult<Oref> {
        self.arena.record(oref, oref);
        if self.broker.sm(oref)?.owner().is_some() {
            return Ok(oref);
        }
        let actions = self.actions(oref);
        if !actions.run || !actions.cascade {
            return Ok(oref);
        }
        let meta = self.broker.meta_of(oref)?;
        for fmd in meta.fields() {
            if !fmd.is_relation()
                || fmd.value.is_embedded_pc()
                || !fmd.cascade_policy(CascadeOp::Attach).cascades()
                || !self.broker.sm(oref)?.loaded().contains(fmd.index)
            {
                continue;
            }
            let value = self.broker.sm(oref)?.fetch_field(fmd.index)?;
            let merged = value.try_map_refs(&mut |target| -> SteadResult<FieldValue> {
                Ok(FieldValue::Ref(self.attach_internal(target)?))
            })?;
            if merged != value {
                self.broker
                    .set_internal(oref, fmd.index, merged, SetKind::Attach)?;
            }
        }
        Ok(oref)
    }

    /// Persist a detached instance that has no stored row yet
    fn attach_new(
        &mut self,
        oref: Oref,
        strategy: &dyn AttachStrategy,
        meta: &Arc<ClassMetaData>,
        cascade: bool,
    ) -> SteadResult<Oref> {
        let managed = if self.broker.config.attach.copy_new {
            let blank = self.broker.heap.get(oref)?.pc().new_instance();
            let managed = self.broker.heap.insert(Instance::Unmanaged(blank));
            self.arena.record(oref, managed);
            for (index, _) in strategy.copy_plan(meta) {
                let fmd = meta.require_field(index)?;
                let value = self.broker.heap.get(oref)?.pc().provide_field(index);
                let value = self.merged_value(fmd, value, cascade)?;
                self.broker
                    .heap
                    .get_mut(managed)?
                    .pc_mut()
                    .replace_field(index, value);
            }
            managed
        } else {
            self.strip_bookkeeping(oref)?;
            self.arena.record(oref, oref);
            for fmd in meta.fields() {
                if !fmd.is_relation() || fmd.value.is_embedded_pc() {
                    continue;
                }
                let value = self.broker.heap.get(oref)?.pc().provide_field(fmd.index);
                let value = self.merged_value(fmd, value, cascade)?;
                self.broker
                    .heap
                    .get_mut(oref)?
                    .pc_mut()
                    .replace_field(fmd.index, value);
            }
            oref
        };
        self.broker.fire_event(EventKind::BeforeAttach, oref, Some(managed))?;
        let mut visited = FxHashSet::default();
        self.broker.persist_internal(managed, false, &mut visited)?;
        self.broker.fire_event(EventKind::AfterAttach, managed, Some(oref))?;
        debug!(oref = %oref, managed = %managed, "new instance attached");
        Ok(managed)
    }

    /// Turn a detached copy into a plain unmanaged instance
    fn strip_bookkeeping(&mut self, oref: Oref) -> SteadResult<()> {
        let mut pc = match self.broker.heap.take(oref)? {
            Instance::Detached(dsm) => dsm.into_parts().0,
            Instance::Unmanaged(pc) => pc,
            other => {
                self.broker.heap.put(oref, other)?;
                return Err(SteadError::internal("managed instance attached as new"));
            }
        };
        pc.set_detached_state(None);
        self.broker.heap.put(oref, Instance::Unmanaged(pc))
    }

    /// The managed side had an older version: take the newer one
    fn adopt_version(
        &mut self,
        managed: Oref,
        meta: &ClassMetaData,
        version: stead_core::Version,
    ) -> SteadResult<()> {
        if let Some(vf) = meta.version_field() {
            let value = version.to_field_value(vf.type_code());
            self.broker.sm_mut(managed)?.store_field(vf.index, value)?;
        }
        self.broker.sm_mut(managed)?.set_version(Some(version))
    }

    fn copy_fields(
        &mut self,
        oref: Oref,
        managed: Oref,
        strategy: &dyn AttachStrategy,
        meta: &ClassMetaData,
        cascade: bool,
    ) -> SteadResult<()> {
        let proxy = Arc::clone(&self.broker.proxy);
        for (index, mode) in strategy.copy_plan(meta) {
            let fmd = meta.require_field(index)?;
            if fmd.primary_key || fmd.version || !fmd.is_persistent() {
                continue;
            }
            // relations always merge so cascades reach the related copies
            if mode == CopyMode::StoreIfUnloaded
                && !fmd.is_relation()
                && self.broker.sm(managed)?.loaded().contains(index)
            {
                continue;
            }
            let value = self.broker.heap.get(oref)?.pc().provide_field(index);
            if fmd.value.is_embedded_pc() {
                self.attach_embedded(managed, fmd, value, cascade)?;
                continue;
            }
            let value = if fmd.is_relation() {
                self.attach_relation(fmd, value, cascade)?
            } else {
                proxy.copy_value(fmd, &value)?
            };
            match mode {
                CopyMode::Set => {
                    self.broker.set_internal(managed, index, value, SetKind::Attach)?;
                }
                CopyMode::StoreIfUnloaded => {
                    self.broker.sm_mut(managed)?.store_field(index, value)?;
                }
            }
        }
        Ok(())
    }

    /// Field value for a newly persisted instance
    fn merged_value(
        &mut self,
        fmd: &FieldMetaData,
        value: FieldValue,
        cascade: bool,
    ) -> SteadResult<FieldValue> {
        if fmd.value.is_embedded_pc() {
            return match value {
                FieldValue::Ref(embedded) => {
                    let mut copy = self.broker.heap.get(embedded)?.pc().copy_fields();
                    copy.set_detached_state(None);
                    Ok(FieldValue::Ref(self.broker.heap.insert(Instance::Unmanaged(copy))))
                }
                other => Ok(other),
            };
        }
        if fmd.is_relation() {
            return self.attach_relation(fmd, value, cascade);
        }
        self.broker.proxy.copy_value(fmd, &value)
    }

    /// Merge a detached embedded value into the managed owner's field.
    /// Fields of an embedded instance already owned by the field are
    /// updated in place; otherwise a fresh embedded instance replaces it.
    fn attach_embedded(
        &mut self,
        managed: Oref,
        fmd: &FieldMetaData,
        value: FieldValue,
        cascade: bool,
    ) -> SteadResult<()> {
        let FieldValue::Ref(source) = value else {
            self.broker
                .set_internal(managed, fmd.index, FieldValue::Null, SetKind::Attach)?;
            return Ok(());
        };
        self.broker.ensure_loaded(managed, fmd.index)?;
        let current = self.broker.sm(managed)?.fetch_field(fmd.index)?;
        let owned = match current {
            FieldValue::Ref(existing) => match self.broker.heap.get(existing)? {
                Instance::Managed(sm) if sm.owner() == Some((managed, fmd.index)) => Some(existing),
                _ => None,
            },
            _ => None,
        };

        if let Some(existing) = owned {
            let meta = self.broker.meta_of(existing)?;
            for efmd in meta.fields() {
                let v = self.broker.heap.get(source)?.pc().provide_field(efmd.index);
                let v = if efmd.value.is_embedded_pc() {
                    self.attach_embedded(existing, efmd, v, cascade)?;
                    continue;
                } else if efmd.is_relation() {
                    self.attach_relation(efmd, v, cascade)?
                } else {
                    self.broker.proxy.copy_value(efmd, &v)?
                };
                self.broker.set_internal(existing, efmd.index, v, SetKind::Attach)?;
            }
            return Ok(());
        }

        let mut copy = self.broker.heap.get(source)?.pc().copy_fields();
        copy.set_detached_state(None);
        let fresh = self.broker.heap.insert(Instance::Unmanaged(copy));
        let meta = self.broker.meta_of(fresh)?;
        for efmd in meta.fields().iter().filter(|f| f.is_relation() && !f.value.is_embedded_pc()) {
            let v = self.broker.heap.get(fresh)?.pc().provide_field(efmd.index);
            let v = self.attach_relation(efmd, v, cascade)?;
            self.broker.heap.get_mut(fresh)?.pc_mut().replace_field(efmd.index, v);
        }
        self.broker
            .set_internal(managed, fmd.index, FieldValue::Ref(fresh), SetKind::Attach)?;
        self.broker.embed(managed, fmd.index, fresh)?;
        Ok(())
    }

    /// Relation value for the managed side: cascaded targets are attached,
    /// others resolved to the instance this context holds for them
    fn attach_relation(
        &mut self,
        fmd: &FieldMetaData,
        value: FieldValue,
        cascade: bool,
    ) -> SteadResult<FieldValue> {
        let follow = cascade && fmd.cascade_policy(CascadeOp::Attach).cascades();
        value.try_map_refs(&mut |target| -> SteadResult<FieldValue> {
            let resolved = if follow {
                self.attach_internal(target)?
            } else {
                self.reference_for(target)?
            };
            Ok(FieldValue::Ref(resolved))
        })
    }

    fn reference_for(&mut self, target: Oref) -> SteadResult<Oref> {
        if let Some(managed) = self.arena.produced(target) {
            return Ok(managed);
        }
        if self.broker.is_managed(target) {
            return Ok(target);
        }
        let oid = match self.broker.heap.get(target)? {
            Instance::Unmanaged(pc) if pc.detached_state().is_none() => {
                self.broker.oid_from_key(pc.as_ref())?
            }
            _ => self.broker.object_id(target)?,
        };
        match oid {
            Some(oid) => self.broker.get_reference(&oid),
            // left for persist cascade or flush to resolve
            None => Ok(target),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::broker::tests::{broker, broker_with, committed_person, person};
    use crate::config::KernelConfig;
    use crate::events::{EventKind, OpActions};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use stead_core::{CascadeOp, FieldValue, Oref, SteadError};
    use stead_lifecycle::PCState;

    #[test]
    fn test_attach_applies_detached_change() {
        let mut b = broker();
        let p = committed_person(&mut b, 1, "Ann", 30);
        let copy = b.detach(p, None).unwrap();
        b.set(copy, "age", 31).unwrap();
        let managed = b
            .transaction(|b| {
                let m = b.attach(copy, None)?;
                assert_eq!(b.state(m)?, Some(PCState::Dirty));
                Ok(m)
            })
            .unwrap();
        assert_eq!(managed, p);
        assert_eq!(b.get(p, "age").unwrap(), FieldValue::Int(31));
    }

    #[test]
    fn test_unchanged_copy_leaves_managed_clean() {
        let mut b = broker();
        let p = committed_person(&mut b, 1, "Ann", 30);
        let copy = b.detach(p, None).unwrap();
        b.transaction(|b| {
            let m = b.attach(copy, None)?;
            assert!(!b.state(m)?.unwrap().is_dirty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_stale_copy_is_rejected() {
        let mut b = broker();
        let p = committed_person(&mut b, 1, "Ann", 30);
        let stale = b.detach(p, None).unwrap();
        b.transaction(|b| b.set(p, "age", 40)).unwrap();
        b.set(stale, "age", 31).unwrap();
        let err = b.transaction(|b| b.attach(stale, None)).unwrap_err();
        assert!(err.is_optimistic());
        assert_eq!(b.get(p, "age").unwrap(), FieldValue::Int(40));
    }

    #[test]
    fn test_attach_into_fresh_context_loads_from_store() {
        let mut b = broker();
        let p = committed_person(&mut b, 1, "Ann", 30);
        let copy = b.detach(p, None).unwrap();
        b.set(copy, "name", "Anna").unwrap();
        let token = b.take(copy).unwrap();

        let mut b2 = broker_with(b.store.clone(), KernelConfig::default());
        let detached = b2.insert_boxed(token);
        b2.transaction(|b2| b2.attach(detached, None).map(|_| ()))
            .unwrap();

        let mut b3 = broker_with(b.store.clone(), KernelConfig::default());
        let oid = b.object_id(p).unwrap().unwrap();
        let fresh = b3.find(&oid).unwrap().unwrap();
        assert_eq!(b3.get(fresh, "name").unwrap(), FieldValue::from("Anna"));
    }

    #[test]
    fn test_plain_instance_with_unknown_key_is_persisted() {
        let mut b = broker();
        let p = b.insert(person(9, "Neo", 20));
        let managed = b.transaction(|b| b.attach(p, None)).unwrap();
        assert_ne!(managed, p);
        assert!(b.is_managed(managed));
        assert!(!b.is_managed(p));
    }

    #[test]
    fn test_plain_instance_with_known_key_merges() {
        let mut b = broker();
        let p = committed_person(&mut b, 1, "Ann", 30);
        let other = b.insert(person(1, "Ann", 33));
        let managed = b.transaction(|b| b.attach(other, None)).unwrap();
        assert_eq!(managed, p);
        assert_eq!(b.get(p, "age").unwrap(), FieldValue::Int(33));
    }

    #[test]
    fn test_cycle_attaches_once_per_copy() {
        let mut b = broker();
        let (a, c) = b
            .transaction(|b| {
                let a = b.insert(person(1, "A", 1));
                let c = b.insert(person(2, "C", 2));
                b.persist(a)?;
                b.persist(c)?;
                b.set(a, "best_friend", c)?;
                b.set(c, "best_friend", a)?;
                Ok((a, c))
            })
            .unwrap();
        let copy_a = b.detach(a, None).unwrap();
        let managed = b.transaction(|b| b.attach(copy_a, None)).unwrap();
        assert_eq!(managed, a);
        assert_eq!(b.get(a, "best_friend").unwrap(), FieldValue::Ref(c));
        assert_eq!(b.get(c, "best_friend").unwrap(), FieldValue::Ref(a));
    }

    #[test]
    fn test_change_on_cascaded_copy_is_merged() {
        let mut b = broker();
        let (a, c) = b
            .transaction(|b| {
                let a = b.insert(person(1, "A", 1));
                let c = b.insert(person(2, "C", 2));
                b.persist(a)?;
                b.persist(c)?;
                b.set(a, "best_friend", c)?;
                Ok((a, c))
            })
            .unwrap();
        let copy_a = b.detach(a, None).unwrap();
        let FieldValue::Ref(copy_c) = b.get(copy_a, "best_friend").unwrap() else {
            panic!("expected a reference");
        };
        b.set(copy_c, "name", "Cy").unwrap();

        b.transaction(|b| b.attach(copy_a, None).map(|_| ())).unwrap();
        assert_eq!(b.get(a, "best_friend").unwrap(), FieldValue::Ref(c));
        assert_eq!(b.get(c, "name").unwrap(), FieldValue::from("Cy"));
    }

    #[test]
    fn test_unflushed_change_outlives_rollback() {
        let mut b = broker();
        let p = committed_person(&mut b, 1, "Ann", 30);
        b.begin().unwrap();
        b.set(p, "age", 99).unwrap();
        let copy = b.detach(p, None).unwrap();
        b.rollback().unwrap();
        assert_eq!(b.get(p, "age").unwrap(), FieldValue::Int(30));
        assert_eq!(b.get(copy, "age").unwrap(), FieldValue::Int(99));

        b.transaction(|b| b.attach(copy, None).map(|_| ())).unwrap();
        assert_eq!(b.get(p, "age").unwrap(), FieldValue::Int(99));
    }

    #[test]
    fn test_missing_row_with_version_is_optimistic() {
        let mut b = broker();
        let p = committed_person(&mut b, 1, "Ann", 30);
        let copy = b.detach(p, None).unwrap();
        b.transaction(|b| b.delete(p)).unwrap();
        let err = b.transaction(|b| b.attach(copy, None)).unwrap_err();
        assert!(err.is_optimistic());
    }

    #[test]
    fn test_skipped_instance_is_returned_unchanged() {
        let mut b = broker();
        let p = committed_person(&mut b, 1, "Ann", 30);
        let copy = b.detach(p, None).unwrap();
        let skip = |_op: CascadeOp, _o: Oref| OpActions::SKIP;
        let out = b.transaction(|b| b.attach(copy, Some(&skip))).unwrap();
        assert_eq!(out, copy);
    }

    #[test]
    fn test_attach_all_collects_failures() {
        let mut b = broker();
        let good = committed_person(&mut b, 1, "Ann", 30);
        let bad = committed_person(&mut b, 2, "Bo", 30);
        let good_copy = b.detach(good, None).unwrap();
        let bad_copy = b.detach(bad, None).unwrap();
        b.transaction(|b| b.set(bad, "age", 50)).unwrap();

        let attached = Arc::new(Mutex::new(Vec::new()));
        let attached_in = Arc::clone(&attached);
        b.add_listener_for(
            &[EventKind::AfterAttach],
            Arc::new(move |e: &crate::events::LifecycleEvent| {
                attached_in.lock().push(e.oref);
                Ok(())
            }),
        );
        b.begin().unwrap();
        let err = b.attach_all(&[bad_copy, good_copy], None).unwrap_err();
        assert!(matches!(err, SteadError::Optimistic { .. }));
        assert_eq!(*attached.lock(), vec![Some(good)]);
        b.rollback().unwrap();
    }
}
