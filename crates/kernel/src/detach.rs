//! Graph detachment
//!
//! [`DetachManager`] turns managed instances into standalone copies that no
//! longer belong to the broker but keep what a later attach needs: the
//! object id, the version and the set of fields that were carried over.
//!
//! One manager serves one top-level call. Every original reached during the
//! call is recorded in a [`VisitArena`] before its fields are copied, so
//! cycles and shared sub-graphs produce exactly one copy per original.
//! `AfterDetach` events fire in a separate pass once the whole graph is
//! detached.

use crate::broker::Broker;
use crate::config::DetachMode;
use crate::events::{EventKind, OpActions, OpCallbacks};
use crate::heap::Instance;
use std::sync::Arc;
use stead_core::{
    CascadeOp, CascadePolicy, DetachedState, DetachedStateMode, FieldMetaData, FieldSet,
    FieldValue, Oref, SteadError, SteadResult, VisitArena,
};
use stead_lifecycle::{DetachedOptions, DetachedSnapshot, DetachedStateManager, OpenStateManager};
use tracing::{debug, warn};

/// Detaches instances for one top-level operation
pub(crate) struct DetachManager<'a> {
    broker: &'a mut Broker,
    callbacks: Option<&'a dyn OpCallbacks>,
    arena: VisitArena,
    flushed: bool,
    fail_fast: bool,
}

impl<'a> DetachManager<'a> {
    pub(crate) fn new(broker: &'a mut Broker, callbacks: Option<&'a dyn OpCallbacks>) -> Self {
        let fail_fast = broker.config.callbacks.fail_fast;
        DetachManager {
            broker,
            callbacks,
            arena: VisitArena::new(),
            flushed: false,
            fail_fast,
        }
    }

    fn copy_on_detach(&self) -> bool {
        self.broker.config.compatibility.copy_on_detach
    }

    /// Detach one instance; returns the copy, or `oref` itself when detaching
    /// in place or when it is not managed
    pub(crate) fn detach(mut self, oref: Oref) -> SteadResult<Oref> {
        if !self.copy_on_detach() {
            self.detach_in_place(&[oref])?;
            return Ok(oref);
        }
        let copy = self.detach_root(oref)?;
        let errors = self.after_detach()?;
        debug!(root = %oref, detached = self.arena.len(), "detached");
        match SteadError::collect("after-detach callbacks failed", errors) {
            Some(err) => Err(err),
            None => Ok(copy),
        }
    }

    /// Detach several instances. Returns `None` when detaching in place.
    pub(crate) fn detach_all(mut self, orefs: &[Oref]) -> SteadResult<Option<Vec<Oref>>> {
        if !self.copy_on_detach() {
            self.detach_in_place(orefs)?;
            return Ok(None);
        }
        let mut copies = Vec::with_capacity(orefs.len());
        let mut errors = Vec::new();
        for &oref in orefs {
            match self.detach_root(oref) {
                Ok(copy) => copies.push(copy),
                Err(e) if self.fail_fast => return Err(e),
                Err(e) => {
                    debug!(oref = %oref, error = %e, "detach failed; continuing");
                    errors.push(e);
                }
            }
        }
        errors.extend(self.after_detach()?);
        debug!(roots = orefs.len(), detached = self.arena.len(), failures = errors.len(), "detached all");
        if errors.is_empty() {
            Ok(Some(copies))
        } else {
            Err(SteadError::nested("detach failed", errors))
        }
    }

    /// Detach the instances themselves: each leaves the broker and keeps
    /// its detached bookkeeping in place
    pub(crate) fn detach_in_place(mut self, orefs: &[Oref]) -> SteadResult<()> {
        let needs_flush = self.broker.tx.is_some()
            && orefs.iter().any(|&oref| {
                self.broker
                    .sm(oref)
                    .map(|sm| sm.state().is_dirty() || sm.state().is_new())
                    .unwrap_or(false)
            });
        if needs_flush {
            self.broker.flush_internal()?;
            self.flushed = true;
        }

        let mut errors = Vec::new();
        for &oref in orefs {
            if let Err(e) = self.detach_in_place_internal(oref) {
                if self.fail_fast {
                    return Err(e);
                }
                errors.push(e);
            }
        }
        errors.extend(self.after_detach()?);
        debug!(roots = orefs.len(), detached = self.arena.len(), failures = errors.len(), "detached in place");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SteadError::nested("detach failed", errors))
        }
    }

    // =========================================================================
    // Per-instance work
    // =========================================================================

    fn actions(&self, oref: Oref) -> OpActions {
        self.callbacks
            .map(|c| c.process_argument(CascadeOp::Detach, oref))
            .unwrap_or(OpActions::ALL)
    }

    /// Shared preamble: `None` when the instance is left alone
    fn begin_instance(&mut self, oref: Oref) -> SteadResult<Option<OpActions>> {
        if !self.broker.is_managed(oref) {
            return Ok(None);
        }
        let actions = self.actions(oref);
        if !actions.run {
            return Ok(None);
        }
        let sm = self.broker.sm(oref)?;
        if sm.state().is_deleted() {
            return Err(SteadError::user_with(
                "cannot detach a deleted instance",
                self.broker.failed(oref),
            ));
        }
        let dirty = sm.state().is_dirty();
        self.broker.fire(EventKind::BeforeDetach, oref)?;
        if dirty
            && self.broker.config.compatibility.flush_before_detach
            && self.broker.tx.is_some()
            && !self.flushed
        {
            self.broker.flush_internal()?;
            self.flushed = true;
        }
        Ok(Some(actions))
    }

    /// Fields the detached copy carries, loading them first as the detach
    /// mode requires. Large-result-set fields are never carried.
    fn detach_fields(&mut self, oref: Oref) -> SteadResult<FieldSet> {
        let meta = self.broker.meta_of(oref)?;
        let wanted = match self.broker.config.detach.state {
            DetachMode::Loaded => None,
            DetachMode::FetchGroups => {
                let mut fields = self.broker.fetch.fields_for(&meta);
                fields.union_with(&meta.pk_field_set());
                Some(fields)
            }
            DetachMode::All => Some(meta.field_set()),
        };
        if let Some(wanted) = &wanted {
            self.broker.load_fields(oref, wanted)?;
        }
        let sm = self.broker.sm(oref)?;
        let mut fields = sm.loaded().clone();
        if let Some(wanted) = &wanted {
            fields.intersect_with(wanted);
        }
        for fmd in meta.fields() {
            if fmd.lrs {
                fields.remove(fmd.index);
            }
        }
        if self.broker.config.compatibility.reload_on_detach {
            let mut reload = fields.clone();
            reload.difference_with(sm.dirty());
            self.broker.reload_fields(oref, &reload)?;
        }
        Ok(fields)
    }

    /// Detach the graph under one root. On failure every copy made for it
    /// is dropped so no partial copy survives or sees after-detach events.
    fn detach_root(&mut self, oref: Oref) -> SteadResult<Oref> {
        let mark = self.arena.len();
        self.detach_internal(oref).map_err(|e| {
            for copy in self.arena.truncate(mark) {
                if self.broker.heap.contains(copy) {
                    let _ = self.broker.heap.remove(copy);
                }
            }
            e
        })
    }

    fn detach_internal(&mut self, oref: Oref) -> SteadResult<Oref> {
        if let Some(copy) = self.arena.produced(oref) {
            return Ok(copy);
        }
        let Some(actions) = self.begin_instance(oref)? else {
            return Ok(oref);
        };
        let fields = self.detach_fields(oref)?;
        let meta = self.broker.meta_of(oref)?;

        let blank = self.broker.sm(oref)?.pc().new_instance();
        let copy = self.broker.heap.insert(Instance::Unmanaged(blank));
        self.arena.record(oref, copy);

        let proxy = Arc::clone(&self.broker.proxy);
        for index in copy_order(&meta, &fields) {
            let fmd = meta.require_field(index)?;
            let value = self.broker.sm(oref)?.fetch_field(index)?;
            let value = if fmd.is_relation() {
                self.detach_relation(fmd, value, actions.cascade)?
            } else {
                proxy.copy_value(fmd, &value)?
            };
            self.broker.heap.get_mut(copy)?.pc_mut().replace_field(index, value);
        }

        let sm = self.broker.sm(oref)?;
        let new_unflushed = sm.state().is_new() && !sm.is_flushed_instance();
        let snapshot = DetachedSnapshot {
            oid: if new_unflushed {
                None
            } else {
                sm.object_id().filter(|oid| !oid.is_temporary()).cloned()
            },
            version: sm.version().cloned(),
            dirty: sm.unflushed_dirty(),
            loaded: fields,
            embedded: sm.owner().is_some(),
        };
        self.install_bookkeeping(copy, snapshot, new_unflushed)?;
        Ok(copy)
    }

    /// Relation value of a detached copy: cascaded targets are replaced by
    /// their copies, others keep the raw handle
    fn detach_relation(
        &mut self,
        fmd: &FieldMetaData,
        value: FieldValue,
        cascade: bool,
    ) -> SteadResult<FieldValue> {
        let policy = fmd.cascade_policy(CascadeOp::Detach);
        let follow = cascade
            && !fmd.lrs
            && (policy == CascadePolicy::Immediate
                || self.broker.config.compatibility.cascade_with_detach);
        if !follow {
            return self.broker.proxy.copy_value(fmd, &value);
        }
        value.try_map_refs(&mut |target| -> SteadResult<FieldValue> {
            Ok(FieldValue::Ref(self.detach_internal(target)?))
        })
    }

    /// Give a fresh copy its state manager or token
    fn install_bookkeeping(
        &mut self,
        copy: Oref,
        snapshot: DetachedSnapshot,
        new_unflushed: bool,
    ) -> SteadResult<()> {
        let mode = self.broker.heap.get(copy)?.meta().detached_state();
        let config = Arc::clone(&self.broker.config);
        let detach = &config.detach;
        if detach.lite || mode == DetachedStateMode::None {
            return Ok(());
        }
        if mode == DetachedStateMode::Synthetic && detach.detached_state_manager && !new_unflushed {
            let options = DetachedOptions {
                access_unloaded: detach.access_unloaded,
                multithreaded: config.multithreaded,
            };
            let pc = match self.broker.heap.take(copy)? {
                Instance::Unmanaged(pc) => pc,
                other => {
                    self.broker.heap.put(copy, other)?;
                    return Err(SteadError::internal("detached copy already managed"));
                }
            };
            let dsm = DetachedStateManager::new(pc, snapshot, options);
            return self.broker.heap.put(copy, Instance::Detached(Box::new(dsm)));
        }
        let mut dirty = snapshot.dirty;
        dirty.intersect_with(&snapshot.loaded);
        let token = DetachedState {
            oid: snapshot.oid,
            version: snapshot.version,
            loaded: snapshot.loaded,
            dirty,
            embedded: snapshot.embedded,
        };
        self.broker
            .heap
            .get_mut(copy)?
            .pc_mut()
            .set_detached_state(Some(token));
        Ok(())
    }

    fn detach_in_place_internal(&mut self, oref: Oref) -> SteadResult<()> {
        if self.arena.contains(oref) {
            return Ok(());
        }
        let Some(actions) = self.begin_instance(oref)? else {
            return Ok(());
        };
        let fields = self.detach_fields(oref)?;
        self.arena.record(oref, oref);

        let meta = self.broker.meta_of(oref)?;
        let mut cascade_to = Vec::new();
        if actions.cascade {
            for fmd in meta.fields() {
                if !fmd.is_relation() || !fields.contains(fmd.index) || fmd.lrs {
                    continue;
                }
                let policy = fmd.cascade_policy(CascadeOp::Detach);
                if policy == CascadePolicy::Immediate
                    || self.broker.config.compatibility.cascade_with_detach
                {
                    cascade_to.extend(self.broker.sm(oref)?.fetch_field(fmd.index)?.refs());
                }
            }
        }

        let sm = match self.broker.heap.take(oref)? {
            Instance::Managed(sm) => sm,
            other => {
                self.broker.heap.put(oref, other)?;
                return Err(SteadError::internal("instance left the broker during detach"));
            }
        };
        let new_unflushed = sm.state().is_new() && !sm.is_flushed_instance();
        let snapshot = DetachedSnapshot {
            oid: if new_unflushed {
                None
            } else {
                sm.object_id().filter(|oid| !oid.is_temporary()).cloned()
            },
            version: sm.version().cloned(),
            dirty: sm.unflushed_dirty(),
            loaded: fields,
            embedded: sm.owner().is_some(),
        };
        if let Some(oid) = sm.object_id() {
            if self.broker.by_oid.get(oid) == Some(&oref) {
                self.broker.by_oid.remove(oid);
            }
        }
        self.broker.heap.put(oref, Instance::Unmanaged(sm.into_pc()))?;
        self.install_bookkeeping(oref, snapshot, new_unflushed)?;

        for target in cascade_to {
            self.detach_in_place_internal(target)?;
        }
        Ok(())
    }

    /// `AfterDetach` for every detached copy, in encounter order. Failures
    /// are returned for the caller to aggregate; under fail-fast the first
    /// one aborts.
    fn after_detach(&mut self) -> SteadResult<Vec<SteadError>> {
        let mut errors = Vec::new();
        let pairs: Vec<(Oref, Oref)> = self.arena.pairs().collect();
        for (original, copy) in pairs {
            if !self.broker.heap.contains(copy) {
                continue;
            }
            if let Err(e) = self.broker.fire_event(EventKind::AfterDetach, copy, Some(original)) {
                if self.fail_fast {
                    return Err(e);
                }
                warn!(oref = %copy, error = %e, "after-detach callback failed");
                errors.push(e);
            }
        }
        Ok(errors)
    }
}

/// Primary keys first, then the version, then everything else in
/// declaration order
fn copy_order(meta: &stead_core::ClassMetaData, fields: &FieldSet) -> Vec<usize> {
    let version = meta.version_field().map(|f| f.index);
    let mut order: Vec<usize> = meta.pk_fields().filter(|&i| fields.contains(i)).collect();
    order.extend(version.filter(|&i| fields.contains(i)));
    order.extend(
        fields
            .iter()
            .filter(|&i| Some(i) != version && !meta.fields()[i].primary_key),
    );
    order
}
