//! Bidirectional relation consistency
//!
//! When a relation field with declared inverses is written, the
//! [`InverseManager`] brings the other side in line: instances that left
//! the relation lose their back-pointer, instances that joined it gain one.
//! Depending on [`InverseAction`] the fix-up is applied, logged, or refused.

use crate::broker::Broker;
use crate::config::InverseAction;
use crate::heap::Instance;
use rustc_hash::FxHashSet;
use stead_core::{CascadeOp, FieldMetaData, FieldValue, Oref, SteadError, SteadResult, TypeCode};
use stead_lifecycle::{OpenStateManager, SetKind};
use tracing::warn;

/// Keeps inverse relation fields consistent
#[derive(Debug, Clone, Copy)]
pub struct InverseManager {
    action: InverseAction,
    manage_lrs: bool,
}

impl InverseManager {
    /// Manager reacting to inconsistencies with `action`
    pub fn new(action: InverseAction, manage_lrs: bool) -> Self {
        InverseManager { action, manage_lrs }
    }

    /// Configured reaction
    pub fn action(&self) -> InverseAction {
        self.action
    }

    /// Field `fmd` of `oref` changed from `previous` to `new`; correct the
    /// inverse side of every instance that left or joined the relation
    pub(crate) fn correct_relations(
        &self,
        broker: &mut Broker,
        oref: Oref,
        fmd: &FieldMetaData,
        previous: &FieldValue,
        new: &FieldValue,
    ) -> SteadResult<()> {
        if fmd.inverses.is_empty() || fmd.value.is_embedded_pc() {
            return Ok(());
        }
        if fmd.lrs && !self.manage_lrs {
            return Ok(());
        }
        let Some(class) = fmd.related_class() else {
            return Ok(());
        };
        let related = std::sync::Arc::clone(broker.metadata.require(class)?);

        let added: Vec<Oref> = new.refs();
        let keep: FxHashSet<Oref> = added.iter().copied().collect();
        let mut removed: Vec<Oref> = Vec::new();
        let initial = broker.sm(oref)?.initial_value(fmd.index);
        for target in initial.refs().into_iter().chain(previous.refs()) {
            if !keep.contains(&target) && !removed.contains(&target) {
                removed.push(target);
            }
        }

        for name in &fmd.inverses {
            let Some(inverse) = related.field_named(name) else {
                warn!(class = %class, field = %name, "declared inverse field does not exist");
                continue;
            };
            for &target in &removed {
                if self.skip(broker, fmd, inverse, target)? {
                    continue;
                }
                self.clear(broker, oref, inverse, target)?;
            }
            for &target in &added {
                if target == oref || self.skip(broker, fmd, inverse, target)? {
                    continue;
                }
                self.establish(broker, oref, inverse, target)?;
            }
        }
        Ok(())
    }

    /// Targets left alone: deleted or detached instances, and unloaded
    /// owning sides that will be consistent on their next load
    fn skip(
        &self,
        broker: &Broker,
        fmd: &FieldMetaData,
        inverse: &FieldMetaData,
        target: Oref,
    ) -> SteadResult<bool> {
        if !broker.heap.contains(target) {
            return Ok(true);
        }
        match broker.heap.get(target)? {
            Instance::Detached(_) => Ok(true),
            Instance::Unmanaged(pc) => Ok(pc.detached_state().is_some()),
            Instance::Managed(sm) => {
                if sm.state().is_deleted() {
                    return Ok(true);
                }
                let owning_unloaded = fmd.mapped_by.as_deref() == Some(inverse.name.as_str())
                    && !sm.loaded().contains(inverse.index);
                Ok(owning_unloaded && !fmd.cascade_policy(CascadeOp::Delete).cascades())
            }
        }
    }

    fn clear(
        &self,
        broker: &mut Broker,
        oref: Oref,
        inverse: &FieldMetaData,
        target: Oref,
    ) -> SteadResult<()> {
        let current = broker.get_field(target, inverse.index)?;
        if !current.contains_ref(oref) {
            return Ok(());
        }
        match self.action {
            InverseAction::Manage => {
                broker.set_internal(target, inverse.index, without_ref(&current, oref), SetKind::Inverse)?;
            }
            InverseAction::Warn => {
                warn!(
                    oref = %target,
                    field = %inverse.name,
                    stale = %oref,
                    "inverse relation still points at a removed instance"
                );
            }
            InverseAction::Exception => {
                return Err(SteadError::invalid_state(
                    format!(
                        "inverse field {} of {} still references {}",
                        inverse.name, target, oref
                    ),
                    Some(broker.failed(target)),
                ));
            }
        }
        Ok(())
    }

    fn establish(
        &self,
        broker: &mut Broker,
        oref: Oref,
        inverse: &FieldMetaData,
        target: Oref,
    ) -> SteadResult<()> {
        let current = broker.get_field(target, inverse.index)?;
        let consistent = match inverse.type_code() {
            TypeCode::Pc | TypeCode::PcUntyped => current == FieldValue::Ref(oref),
            _ => current.contains_ref(oref),
        };
        if consistent {
            return Ok(());
        }
        match self.action {
            InverseAction::Manage => {
                let Some(value) = with_ref(inverse, &current, oref) else {
                    return Ok(());
                };
                broker.set_internal(target, inverse.index, value, SetKind::Inverse)?;
            }
            InverseAction::Warn => {
                warn!(
                    oref = %target,
                    field = %inverse.name,
                    expected = %oref,
                    "inverse relation is inconsistent"
                );
            }
            InverseAction::Exception => {
                return Err(SteadError::invalid_state(
                    format!(
                        "inverse field {} of {} does not reference {}",
                        inverse.name, target, oref
                    ),
                    Some(broker.failed(target)),
                ));
            }
        }
        Ok(())
    }
}

/// `value` with every direct reference to `oref` removed
fn without_ref(value: &FieldValue, oref: Oref) -> FieldValue {
    match value {
        FieldValue::Ref(r) if *r == oref => FieldValue::Null,
        FieldValue::Collection { kind, items } => FieldValue::Collection {
            kind: *kind,
            items: items
                .iter()
                .filter(|i| **i != FieldValue::Ref(oref))
                .cloned()
                .collect(),
        },
        FieldValue::Array(items) => FieldValue::Array(
            items
                .iter()
                .filter(|i| **i != FieldValue::Ref(oref))
                .cloned()
                .collect(),
        ),
        other => other.clone(),
    }
}

/// `value` pointing at `oref`; `None` for shapes that are not managed
fn with_ref(inverse: &FieldMetaData, value: &FieldValue, oref: Oref) -> Option<FieldValue> {
    match inverse.type_code() {
        TypeCode::Pc | TypeCode::PcUntyped => Some(FieldValue::Ref(oref)),
        TypeCode::Collection => {
            let mut items = value.elements().to_vec();
            items.push(FieldValue::Ref(oref));
            Some(FieldValue::Collection {
                kind: inverse.collection_kind,
                items,
            })
        }
        TypeCode::Array => {
            let mut items = value.elements().to_vec();
            items.push(FieldValue::Ref(oref));
            Some(FieldValue::Array(items))
        }
        _ => None,
    }
}
