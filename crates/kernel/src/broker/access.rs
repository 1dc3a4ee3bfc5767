//! Mediated field access and loading

use super::Broker;
use crate::events::EventKind;
use crate::heap::Instance;
use crate::store::StoredRow;
use std::sync::Arc;
use stead_core::{
    ClassMetaData, FieldMetaData, FieldSet, FieldValue, ObjectId, Oref, Record, SteadError,
    SteadResult,
};
use stead_lifecycle::{OpenStateManager, PCState, SetKind, StateManagerImpl};

impl Broker {
    // =========================================================================
    // Reads
    // =========================================================================

    /// Value of field `name`
    pub fn get(&mut self, oref: Oref, name: &str) -> SteadResult<FieldValue> {
        let index = self.meta_of(oref)?.index_of(name)?;
        self.get_field(oref, index)
    }

    /// Value of field `index`, loading it first if needed.
    ///
    /// # Errors
    ///
    /// Reading a field a detached copy did not capture fails with
    /// [`SteadError::UnloadedDetached`] unless `detach.access_unloaded` is set.
    pub fn get_field(&mut self, oref: Oref, index: usize) -> SteadResult<FieldValue> {
        self.check_open()?;
        match self.heap.get(oref)? {
            Instance::Unmanaged(pc) => {
                let meta = pc.meta();
                let fmd = meta.require_field(index)?;
                if let Some(token) = pc.detached_state() {
                    if !token.loaded.contains(index) && !self.config.detach.access_unloaded {
                        return Err(SteadError::UnloadedDetached {
                            class: meta.name().to_string(),
                            field: fmd.name.clone(),
                        });
                    }
                }
                Ok(pc.provide_field(index))
            }
            Instance::Detached(dsm) => {
                dsm.accessing_field(index)?;
                dsm.fetch_field(index)
            }
            Instance::Managed(_) => {
                self.ensure_loaded(oref, index)?;
                let sm = self.sm(oref)?;
                sm.accessing_field(index)?;
                sm.fetch_field(index)
            }
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Assign field `name`
    pub fn set(&mut self, oref: Oref, name: &str, value: impl Into<FieldValue>) -> SteadResult<()> {
        let index = self.meta_of(oref)?.index_of(name)?;
        self.set_field(oref, index, value.into())
    }

    /// Assign field `index`. Managed instances are dirtied, inverse
    /// relations corrected and embedded owners dirtied; detached copies
    /// record the change for a later attach.
    pub fn set_field(&mut self, oref: Oref, index: usize, value: FieldValue) -> SteadResult<()> {
        self.check_open()?;
        self.set_internal(oref, index, value, SetKind::User).map(|_| ())
    }

    /// Mark field `index` dirty after mutating its value in place
    pub fn dirty_field(&mut self, oref: Oref, index: usize) -> SteadResult<()> {
        self.check_open()?;
        match self.heap.get_mut(oref)? {
            Instance::Managed(_) => {
                self.ensure_loaded(oref, index)?;
                self.sm_mut(oref)?.dirty_field(index)
            }
            Instance::Detached(dsm) => dsm.dirty_field(index),
            Instance::Unmanaged(pc) => {
                if let Some(mut token) = pc.detached_state().cloned() {
                    if token.loaded.contains(index) {
                        token.dirty.insert(index);
                        pc.set_detached_state(Some(token));
                    }
                }
                Ok(())
            }
        }
    }

    /// Write path shared by user writes, attach and inverse management.
    /// Returns whether the value changed.
    pub(crate) fn set_internal(
        &mut self,
        oref: Oref,
        index: usize,
        value: FieldValue,
        kind: SetKind,
    ) -> SteadResult<bool> {
        match self.heap.get_mut(oref)? {
            Instance::Unmanaged(pc) => {
                pc.meta().require_field(index)?;
                if pc.provide_field(index) == value {
                    return Ok(false);
                }
                pc.replace_field(index, value);
                if let Some(mut token) = pc.detached_state().cloned() {
                    token.loaded.insert(index);
                    token.dirty.insert(index);
                    pc.set_detached_state(Some(token));
                }
                Ok(true)
            }
            Instance::Detached(dsm) => {
                let current = dsm.fetch_field(index)?;
                dsm.setting_field(index, &current, value, kind)
            }
            Instance::Managed(_) => self.set_managed(oref, index, value, kind),
        }
    }

    fn set_managed(
        &mut self,
        oref: Oref,
        index: usize,
        value: FieldValue,
        kind: SetKind,
    ) -> SteadResult<bool> {
        let meta = self.meta_of(oref)?;
        let fmd = meta.require_field(index)?;
        self.ensure_loaded(oref, index)?;

        let sm = self.sm(oref)?;
        let previous = sm.fetch_field(index)?;
        if previous == value && sm.loaded().contains(index) {
            return Ok(false);
        }
        let was_dirty = sm.state().is_dirty();
        let tracked = sm.state().is_persistent() || sm.state().is_transactional();
        if !was_dirty && tracked {
            self.fire(EventKind::BeforeDirty, oref)?;
        }

        let changed = self
            .sm_mut(oref)?
            .setting_field(index, &previous, value.clone(), kind)?;
        if !changed {
            return Ok(false);
        }

        let sm = self.sm(oref)?;
        let owner = sm.owner();
        if !was_dirty && sm.state().is_dirty() {
            self.fire(EventKind::AfterDirty, oref)?;
        }
        if let Some((owner, field)) = owner {
            self.dirty_owner(owner, field)?;
        }
        if kind != SetKind::Inverse && fmd.is_relation() {
            if let Some(inverse) = self.inverse {
                inverse.correct_relations(self, oref, fmd, &previous, &value)?;
            }
        }
        Ok(true)
    }

    /// An embedded value changed: the owner's field is dirty too
    fn dirty_owner(&mut self, owner: Oref, field: usize) -> SteadResult<()> {
        if !self.is_managed(owner) {
            return Ok(());
        }
        self.ensure_loaded(owner, field)?;
        let state = self.sm(owner)?.state();
        if state.is_deleted() || !(state.is_persistent() || state.is_transactional()) {
            return Ok(());
        }
        let was_dirty = state.is_dirty();
        self.sm_mut(owner)?.dirty(field)?;
        if !was_dirty {
            self.fire(EventKind::AfterDirty, owner)?;
        }
        if let Some((next, next_field)) = self.sm(owner)?.owner() {
            self.dirty_owner(next, next_field)?;
        }
        Ok(())
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Make field `index` of a managed instance readable, loading it (and
    /// the active fetch groups, for hollow instances) if needed
    pub(crate) fn ensure_loaded(&mut self, oref: Oref, index: usize) -> SteadResult<()> {
        let needs_load = self.sm_mut(oref)?.before_read(index)?;
        if !needs_load {
            return Ok(());
        }
        let sm = self.sm(oref)?;
        let mut wanted = FieldSet::from_indices(sm.meta().field_count(), [index]);
        if sm.loaded().is_subset(&sm.meta().pk_field_set()) {
            wanted.union_with(&self.fetch.fields_for(sm.meta()));
        }
        self.load_fields(oref, &wanted)
    }

    /// Load the fields of `wanted` that are not loaded yet
    pub(crate) fn load_fields(&mut self, oref: Oref, wanted: &FieldSet) -> SteadResult<()> {
        let sm = self.sm(oref)?;
        if sm.state().is_new() || !sm.state().is_persistent() || sm.owner().is_some() {
            return Ok(());
        }
        let missing = sm.unloaded(wanted);
        if missing.is_empty() {
            return Ok(());
        }
        let oid = sm
            .object_id()
            .cloned()
            .ok_or_else(|| SteadError::internal("persistent instance without identity"))?;
        let row = self
            .load_row(&oid)?
            .ok_or(SteadError::ObjectNotFound { oid })?;
        self.apply_row(oref, row, &missing)?;
        self.fire(EventKind::AfterLoad, oref)
    }

    /// Reload `fields` from the store, overwriting clean in-memory values
    pub(crate) fn reload_fields(&mut self, oref: Oref, fields: &FieldSet) -> SteadResult<()> {
        let sm = self.sm(oref)?;
        if sm.state().is_new() || !sm.state().is_persistent() {
            return Ok(());
        }
        let Some(oid) = sm.object_id().cloned() else {
            return Ok(());
        };
        let row = self
            .load_row(&oid)?
            .ok_or(SteadError::ObjectNotFound { oid })?;
        self.apply_row(oref, row, fields)
    }

    /// Committed or transaction-local row, consulting the data cache outside
    /// transactions
    pub(crate) fn load_row(&self, oid: &ObjectId) -> SteadResult<Option<StoredRow>> {
        let cache = match (&self.cache, self.tx) {
            (Some(manager), None) if self.config.data_cache => manager.system_cache(),
            _ => None,
        };
        if let Some(cache) = &cache {
            if let Some(row) = cache.get(oid) {
                return Ok(Some(row));
            }
        }
        let row = self.store.load(self.tx, oid)?;
        if let (Some(cache), Some(row)) = (&cache, &row) {
            cache.put(oid.clone(), row.clone());
        }
        Ok(row)
    }

    /// Merge stored values for `fields` into a managed instance
    pub(crate) fn apply_row(&mut self, oref: Oref, row: StoredRow, fields: &FieldSet) -> SteadResult<()> {
        let meta = self.meta_of(oref)?;
        let mut values = Vec::with_capacity(fields.count());
        for index in fields.iter() {
            let fmd = meta.require_field(index)?;
            if fmd.version {
                continue;
            }
            let stored = row.values.get(index).cloned().unwrap_or(FieldValue::Null);
            values.push((index, self.materialize(oref, fmd, stored)?));
        }
        if let Some(vf) = meta.version_field() {
            values.push((vf.index, row.version.to_field_value(vf.type_code())));
        }
        self.sm_mut(oref)?.load(values, Some(row.version));
        Ok(())
    }

    /// Stored form of a value → heap form: ids become handles and embedded
    /// rows become managed embedded instances
    fn materialize(&mut self, owner: Oref, fmd: &FieldMetaData, value: FieldValue) -> SteadResult<FieldValue> {
        if fmd.value.is_embedded_pc() {
            return match value {
                FieldValue::Array(values) => {
                    let class = fmd.related_class().ok_or_else(|| {
                        SteadError::internal(format!("embedded field {} has no class", fmd.name))
                    })?;
                    let meta = Arc::clone(self.metadata.require(class)?);
                    Ok(FieldValue::Ref(self.embedded_from_store(owner, fmd.index, meta, values)?))
                }
                other => Ok(other),
            };
        }
        if fmd.is_relation() {
            return self.resolve_ids(&value);
        }
        Ok(value)
    }

    fn embedded_from_store(
        &mut self,
        owner: Oref,
        field: usize,
        meta: Arc<ClassMetaData>,
        values: Vec<FieldValue>,
    ) -> SteadResult<Oref> {
        let state = if self.flags.is_active() {
            PCState::EmbeddedClean
        } else {
            PCState::EmbeddedNonTransactional
        };
        let mut sm = StateManagerImpl::new(
            Box::new(Record::new(Arc::clone(&meta))),
            Arc::clone(&self.flags),
            state,
        );
        sm.set_owner(Some((owner, field)));
        let oref = self.heap.insert(Instance::Managed(Box::new(sm)));
        for (index, value) in values.into_iter().enumerate() {
            let Some(fmd) = meta.field(index) else { continue };
            let value = self.materialize(oref, fmd, value)?;
            self.sm_mut(oref)?.store_field(index, value)?;
        }
        Ok(oref)
    }

    /// Replace every object id inside `value` with a handle
    pub(crate) fn resolve_ids(&mut self, value: &FieldValue) -> SteadResult<FieldValue> {
        Ok(match value {
            FieldValue::ObjectId(oid) => FieldValue::Ref(self.get_reference(oid)?),
            FieldValue::Collection { kind, items } => FieldValue::Collection {
                kind: *kind,
                items: items
                    .iter()
                    .map(|i| self.resolve_ids(i))
                    .collect::<SteadResult<_>>()?,
            },
            FieldValue::Array(items) => FieldValue::Array(
                items
                    .iter()
                    .map(|i| self.resolve_ids(i))
                    .collect::<SteadResult<_>>()?,
            ),
            FieldValue::Map(entries) => FieldValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((self.resolve_ids(k)?, self.resolve_ids(v)?)))
                    .collect::<SteadResult<_>>()?,
            ),
            other => other.clone(),
        })
    }
}
