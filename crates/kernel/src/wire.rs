//! Serialized detached graphs
//!
//! Detached copies can leave the process: [`Broker::export_detached`] walks
//! the copies reachable from some roots and writes each one out through a
//! [`DetachedValueStateManager`], capturing its detached-state token and the
//! fields it carries. [`Broker::import_detached`] rebuilds the copies in any
//! broker's heap, ready to be attached.
//!
//! References between exported copies become graph positions. References to
//! managed instances become object ids and are resolved with
//! [`Broker::get_reference`] on import.

use crate::broker::Broker;
use crate::heap::Instance;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stead_core::{
    DetachedState, FieldValue, Oref, PersistenceCapable, Record, SteadError, SteadResult,
};
use stead_lifecycle::{DetachedValueStateManager, FieldManager, OpenStateManager};
use tracing::debug;

/// One detached instance in serialized form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetachedRecord {
    /// Class name
    pub class: String,
    /// Detached bookkeeping; `None` for copies detached without any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<DetachedState>,
    /// Captured fields in index order
    pub fields: Vec<(usize, FieldValue)>,
}

/// A set of detached instances and the roots they were exported from.
///
/// Inside `fields`, `FieldValue::Ref` holds the position of another record
/// in `records` (its generation is always zero).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetachedGraph {
    /// Every exported instance
    pub records: Vec<DetachedRecord>,
    /// Positions of the roots, in export order
    pub roots: Vec<usize>,
}

impl DetachedGraph {
    /// Serialize to bytes (MessagePack)
    pub fn to_bytes(&self) -> SteadResult<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| SteadError::Serialization(e.to_string()))
    }

    /// Deserialize from bytes (MessagePack)
    pub fn from_bytes(data: &[u8]) -> SteadResult<Self> {
        rmp_serde::from_slice(data).map_err(|e| SteadError::Serialization(e.to_string()))
    }

    /// Serialize to a JSON string
    pub fn to_json(&self) -> SteadResult<String> {
        serde_json::to_string(self).map_err(|e| SteadError::Serialization(e.to_string()))
    }

    /// Deserialize from a JSON string
    pub fn from_json(json: &str) -> SteadResult<Self> {
        serde_json::from_str(json).map_err(|e| SteadError::Serialization(e.to_string()))
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the graph is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Gathers provided fields in order
#[derive(Default)]
struct Collector(Vec<(usize, FieldValue)>);

impl FieldManager for Collector {
    fn store_field(&mut self, index: usize, value: FieldValue) -> SteadResult<()> {
        self.0.push((index, value));
        Ok(())
    }

    fn fetch_field(&mut self, index: usize) -> SteadResult<FieldValue> {
        Err(SteadError::internal(format!(
            "collector cannot supply field {}",
            index
        )))
    }
}

impl Broker {
    /// Write out the detached copies reachable from `roots`.
    ///
    /// # Errors
    ///
    /// Fails with a user error when a root is still managed.
    pub fn export_detached(&self, roots: &[Oref]) -> SteadResult<DetachedGraph> {
        self.check_open()?;
        let mut positions: FxHashMap<Oref, usize> = FxHashMap::default();
        let mut order: Vec<Oref> = Vec::new();
        let mut pending: Vec<Oref> = Vec::new();
        for &root in roots {
            if self.is_managed(root) {
                return Err(SteadError::user_with(
                    "cannot export a managed instance; detach it first",
                    self.failed(root),
                ));
            }
            pending.push(root);
        }

        // assign positions in discovery order
        let mut captured: Vec<(Option<DetachedState>, Vec<(usize, FieldValue)>)> = Vec::new();
        while let Some(oref) = pending.pop() {
            if positions.contains_key(&oref) {
                continue;
            }
            positions.insert(oref, order.len());
            order.push(oref);
            let (state, fields) = self.capture(oref)?;
            for (_, value) in &fields {
                for target in value.refs() {
                    if !positions.contains_key(&target) && !self.is_managed(target) {
                        pending.push(target);
                    }
                }
            }
            captured.push((state, fields));
        }

        let mut records = Vec::with_capacity(order.len());
        for (oref, (state, fields)) in order.iter().zip(captured) {
            let fields = fields
                .into_iter()
                .map(|(index, value)| -> SteadResult<(usize, FieldValue)> {
                    let value = value
                        .try_map_refs(&mut |target| self.export_ref(&positions, target))?;
                    Ok((index, value))
                })
                .collect::<SteadResult<Vec<_>>>()?;
            records.push(DetachedRecord {
                class: self.heap.get(*oref)?.meta().name().to_string(),
                state,
                fields,
            });
        }
        let roots = roots
            .iter()
            .filter_map(|r| positions.get(r).copied())
            .collect();
        debug!(records = records.len(), "detached graph exported");
        Ok(DetachedGraph { records, roots })
    }

    /// Token and captured fields of one detached instance
    fn capture(
        &self,
        oref: Oref,
    ) -> SteadResult<(Option<DetachedState>, Vec<(usize, FieldValue)>)> {
        let mut collector = Collector::default();
        let state = match self.heap.get(oref)? {
            Instance::Detached(dsm) => {
                let token = dsm.to_token();
                DetachedValueStateManager::new(dsm.pc(), Some(&token)).provide_loaded(&mut collector)?;
                Some(token)
            }
            Instance::Unmanaged(pc) => {
                let token = pc.detached_state().cloned();
                DetachedValueStateManager::new(&**pc, token.as_ref())
                    .provide_loaded(&mut collector)?;
                token
            }
            Instance::Managed(_) => {
                return Err(SteadError::internal("managed instance reached during export"))
            }
        };
        Ok((state, collector.0))
    }

    fn export_ref(&self, positions: &FxHashMap<Oref, usize>, target: Oref) -> SteadResult<FieldValue> {
        if let Some(&pos) = positions.get(&target) {
            return Ok(FieldValue::Ref(Oref::new(pos as u32, 0)));
        }
        Ok(match self.object_id(target)? {
            Some(oid) if !oid.is_temporary() => FieldValue::ObjectId(oid),
            _ => FieldValue::Null,
        })
    }

    /// Rebuild an exported graph in this broker's heap as detached copies.
    /// Returns the handles of the roots.
    pub fn import_detached(&mut self, graph: DetachedGraph) -> SteadResult<Vec<Oref>> {
        self.check_open()?;
        for record in &graph.records {
            let n = self.metadata.require(&record.class)?.field_count();
            if let Some(state) = &record.state {
                if !state.loaded.fits(n) || !state.dirty.fits(n) {
                    return Err(SteadError::Serialization(format!(
                        "detached state of {} does not match its {} fields",
                        record.class, n
                    )));
                }
            }
        }

        let mut orefs = Vec::with_capacity(graph.records.len());
        for record in &graph.records {
            let meta = Arc::clone(self.metadata.require(&record.class)?);
            let mut pc = Record::new(meta);
            pc.set_detached_state(record.state.clone());
            orefs.push(self.insert(pc));
        }

        for (record, &oref) in graph.records.into_iter().zip(&orefs) {
            let meta = self.meta_of(oref)?;
            for (index, value) in record.fields {
                let fmd = meta.require_field(index)?;
                let value = if fmd.is_relation() {
                    self.import_ref(&orefs, value)?
                } else {
                    value
                };
                self.heap.get_mut(oref)?.pc_mut().replace_field(index, value);
            }
        }

        let roots = graph
            .roots
            .iter()
            .map(|&pos| {
                orefs.get(pos).copied().ok_or_else(|| {
                    SteadError::Serialization(format!("root {} is not in the graph", pos))
                })
            })
            .collect::<SteadResult<Vec<_>>>()?;
        debug!(records = orefs.len(), roots = roots.len(), "detached graph imported");
        Ok(roots)
    }

    fn import_ref(&mut self, orefs: &[Oref], value: FieldValue) -> SteadResult<FieldValue> {
        match value {
            FieldValue::Ref(pos) => orefs
                .get(pos.index() as usize)
                .map(|o| FieldValue::Ref(*o))
                .ok_or_else(|| {
                    SteadError::Serialization(format!("reference to missing record {}", pos.index()))
                }),
            FieldValue::ObjectId(oid) => Ok(FieldValue::Ref(self.get_reference(&oid)?)),
            FieldValue::Collection { kind, items } => Ok(FieldValue::Collection {
                kind,
                items: items
                    .into_iter()
                    .map(|i| self.import_ref(orefs, i))
                    .collect::<SteadResult<_>>()?,
            }),
            FieldValue::Array(items) => Ok(FieldValue::Array(
                items
                    .into_iter()
                    .map(|i| self.import_ref(orefs, i))
                    .collect::<SteadResult<_>>()?,
            )),
            FieldValue::Map(entries) => Ok(FieldValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((self.import_ref(orefs, k)?, self.import_ref(orefs, v)?)))
                    .collect::<SteadResult<_>>()?,
            )),
            other => Ok(other),
        }
    }
}
