//! In-memory store with optimistic validation
//!
//! Flushed changes land in a per-transaction overlay that only the owning
//! transaction sees. Every row a transaction touches remembers the committed
//! version it was based on; commit re-validates those versions under the
//! write lock and applies the overlay atomically (first committer wins).

use super::{FlushOp, StoreManager, StoreTxId, StoredRow};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use stead_core::{
    ClassMetaData, FailedObject, FieldValue, IdValue, IdentityType, ObjectId, PersistenceCapable,
    SteadError, SteadResult, Version,
};
use tracing::debug;

#[derive(Debug, Clone)]
enum Pending {
    Put(StoredRow),
    Delete,
}

#[derive(Debug, Default)]
struct TxBuffer {
    writes: FxHashMap<ObjectId, Pending>,
    /// Committed version each touched row was based on; `None` = absent
    base: FxHashMap<ObjectId, Option<Version>>,
}

/// Version mismatch found while validating
#[derive(Debug, Clone, PartialEq)]
struct VersionConflict {
    oid: ObjectId,
    expected: Option<Version>,
    current: Option<Version>,
}

impl VersionConflict {
    fn into_error(conflicts: Vec<VersionConflict>) -> SteadError {
        let message = conflicts
            .iter()
            .map(|c| {
                format!(
                    "{} expected {} found {}",
                    c.oid,
                    c.expected.as_ref().map_or("none".to_string(), |v| v.to_string()),
                    c.current.as_ref().map_or("none".to_string(), |v| v.to_string())
                )
            })
            .collect::<Vec<_>>()
            .join("; ");
        SteadError::Optimistic {
            message,
            failed: conflicts
                .into_iter()
                .map(|c| FailedObject::new(c.oid.class().to_string(), None, Some(c.oid)))
                .collect(),
        }
    }
}

/// Thread-safe in-memory [`StoreManager`]
#[derive(Debug)]
pub struct InMemoryStore {
    committed: RwLock<FxHashMap<ObjectId, StoredRow>>,
    txs: Mutex<FxHashMap<StoreTxId, TxBuffer>>,
    next_tx: AtomicU64,
    sequence: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Empty store
    pub fn new() -> Self {
        InMemoryStore {
            committed: RwLock::new(FxHashMap::default()),
            txs: Mutex::new(FxHashMap::default()),
            next_tx: AtomicU64::new(1),
            sequence: AtomicU64::new(0),
        }
    }

    /// Number of committed rows
    pub fn len(&self) -> usize {
        self.committed.read().len()
    }

    /// Whether no rows are committed
    pub fn is_empty(&self) -> bool {
        self.committed.read().is_empty()
    }

    /// Committed version of `oid`
    pub fn committed_version(&self, oid: &ObjectId) -> Option<Version> {
        self.committed.read().get(oid).map(|r| r.version.clone())
    }

    /// Number of open transactions
    pub fn open_transactions(&self) -> usize {
        self.txs.lock().len()
    }

    fn view(
        &self,
        txs: &FxHashMap<StoreTxId, TxBuffer>,
        tx: Option<StoreTxId>,
        oid: &ObjectId,
    ) -> Option<StoredRow> {
        if let Some(pending) = tx.and_then(|t| txs.get(&t)).and_then(|b| b.writes.get(oid)) {
            return match pending {
                Pending::Put(row) => Some(row.clone()),
                Pending::Delete => None,
            };
        }
        self.committed.read().get(oid).cloned()
    }

    fn check(current: Option<&StoredRow>, oid: &ObjectId, expected: Option<&Version>)
        -> Option<VersionConflict>
    {
        let current_version = current.map(|r| r.version.clone());
        match (expected, &current_version) {
            (Some(exp), Some(cur)) if exp == cur => None,
            (None, Some(_)) => None,
            _ => Some(VersionConflict {
                oid: oid.clone(),
                expected: expected.cloned(),
                current: current_version,
            }),
        }
    }
}

impl StoreManager for InMemoryStore {
    fn begin(&self) -> SteadResult<StoreTxId> {
        let tx = StoreTxId(self.next_tx.fetch_add(1, Ordering::SeqCst));
        self.txs.lock().insert(tx, TxBuffer::default());
        debug!(tx = tx.0, "store transaction begun");
        Ok(tx)
    }

    fn commit(&self, tx: StoreTxId) -> SteadResult<Vec<ObjectId>> {
        let buffer = self
            .txs
            .lock()
            .remove(&tx)
            .ok_or_else(|| SteadError::store(format!("unknown store transaction {}", tx.0)))?;

        let mut committed = self.committed.write();
        let conflicts: Vec<VersionConflict> = buffer
            .base
            .iter()
            .filter_map(|(oid, base)| {
                let current = committed.get(oid).map(|r| r.version.clone());
                (current != *base).then(|| VersionConflict {
                    oid: oid.clone(),
                    expected: base.clone(),
                    current,
                })
            })
            .collect();
        if !conflicts.is_empty() {
            debug!(tx = tx.0, conflicts = conflicts.len(), "store commit rejected");
            return Err(VersionConflict::into_error(conflicts));
        }

        let mut touched = Vec::with_capacity(buffer.writes.len());
        for (oid, pending) in buffer.writes {
            match pending {
                Pending::Put(row) => {
                    committed.insert(oid.clone(), row);
                }
                Pending::Delete => {
                    committed.remove(&oid);
                }
            }
            touched.push(oid);
        }
        touched.sort();
        debug!(tx = tx.0, rows = touched.len(), "store transaction committed");
        Ok(touched)
    }

    fn rollback(&self, tx: StoreTxId) -> SteadResult<()> {
        self.txs.lock().remove(&tx);
        debug!(tx = tx.0, "store transaction rolled back");
        Ok(())
    }

    fn exists(&self, tx: Option<StoreTxId>, oid: &ObjectId) -> SteadResult<bool> {
        let txs = self.txs.lock();
        Ok(self.view(&txs, tx, oid).is_some())
    }

    fn load(&self, tx: Option<StoreTxId>, oid: &ObjectId) -> SteadResult<Option<StoredRow>> {
        let txs = self.txs.lock();
        Ok(self.view(&txs, tx, oid))
    }

    fn flush(&self, tx: StoreTxId, ops: Vec<FlushOp>) -> SteadResult<Vec<(ObjectId, Version)>> {
        let mut txs = self.txs.lock();
        if !txs.contains_key(&tx) {
            return Err(SteadError::store(format!("unknown store transaction {}", tx.0)));
        }

        // validate everything before applying anything
        let mut conflicts = Vec::new();
        for op in &ops {
            let current = self.view(&txs, Some(tx), op.oid());
            match op {
                FlushOp::Insert { oid, .. } => {
                    if current.is_some() {
                        return Err(SteadError::user(format!("duplicate object id {}", oid)));
                    }
                }
                FlushOp::Update { oid, expected, .. } | FlushOp::Delete { oid, expected } => {
                    conflicts.extend(Self::check(current.as_ref(), oid, expected.as_ref()));
                }
                FlushOp::CheckVersion { oid, expected } => {
                    conflicts.extend(Self::check(current.as_ref(), oid, Some(expected)));
                }
            }
        }
        if !conflicts.is_empty() {
            return Err(VersionConflict::into_error(conflicts));
        }

        let now = Utc::now();
        let mut versions = Vec::new();
        for op in ops {
            let oid = op.oid().clone();
            let current = self.view(&txs, Some(tx), &oid);
            let base = self.committed.read().get(&oid).map(|r| r.version.clone());
            let buffer = txs
                .get_mut(&tx)
                .ok_or_else(|| SteadError::internal("store transaction vanished during flush"))?;
            buffer.base.entry(oid.clone()).or_insert(base);
            match op {
                FlushOp::Insert { values, .. } => {
                    let version = Version::initial_counter();
                    buffer.writes.insert(
                        oid.clone(),
                        Pending::Put(StoredRow {
                            values,
                            version: version.clone(),
                        }),
                    );
                    versions.push((oid, version));
                }
                FlushOp::Update { values, .. } => {
                    let Some(mut row) = current else {
                        return Err(SteadError::ObjectNotFound { oid });
                    };
                    for (index, value) in values {
                        if index >= row.values.len() {
                            row.values.resize(index + 1, FieldValue::Null);
                        }
                        row.values[index] = value;
                    }
                    row.version = row.version.next(now);
                    let version = row.version.clone();
                    buffer.writes.insert(oid.clone(), Pending::Put(row));
                    versions.push((oid, version));
                }
                FlushOp::Delete { .. } => {
                    buffer.writes.insert(oid, Pending::Delete);
                }
                FlushOp::CheckVersion { .. } => {}
            }
        }
        Ok(versions)
    }

    fn assign_object_id(
        &self,
        meta: &ClassMetaData,
        pc: &dyn PersistenceCapable,
    ) -> SteadResult<Option<ObjectId>> {
        match meta.identity() {
            IdentityType::Datastore => {
                let id = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Some(ObjectId::datastore(meta.name(), id as i64)))
            }
            IdentityType::Application if meta.generated_pk() => {
                let id = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Some(ObjectId::application(
                    meta.name(),
                    vec![IdValue::Long(id as i64)],
                )))
            }
            IdentityType::Application => {
                let mut key = Vec::new();
                for index in meta.pk_fields() {
                    match pc.provide_field(index).to_id_value() {
                        Some(v) => key.push(v),
                        None => return Ok(None),
                    }
                }
                Ok(Some(ObjectId::application(meta.name(), key)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stead_core::{FieldMetaData, Record, TypeCode};

    fn oid(n: i64) -> ObjectId {
        ObjectId::datastore("Person", n)
    }

    fn insert(store: &InMemoryStore, n: i64, name: &str) -> Version {
        let tx = store.begin().unwrap();
        let versions = store
            .flush(
                tx,
                vec![FlushOp::Insert {
                    oid: oid(n),
                    values: vec![FieldValue::string(name)],
                }],
            )
            .unwrap();
        store.commit(tx).unwrap();
        versions[0].1.clone()
    }

    #[test]
    fn test_flush_is_private_until_commit() {
        let store = InMemoryStore::new();
        let tx = store.begin().unwrap();
        store
            .flush(
                tx,
                vec![FlushOp::Insert {
                    oid: oid(1),
                    values: vec!["Ann".into()],
                }],
            )
            .unwrap();
        assert!(store.exists(Some(tx), &oid(1)).unwrap());
        assert!(!store.exists(None, &oid(1)).unwrap());
        assert_eq!(store.commit(tx).unwrap(), vec![oid(1)]);
        assert!(store.exists(None, &oid(1)).unwrap());
        assert_eq!(store.open_transactions(), 0);
    }

    #[test]
    fn test_update_bumps_counter_version() {
        let store = InMemoryStore::new();
        let v1 = insert(&store, 1, "Ann");
        assert_eq!(v1, Version::Counter(1));
        let tx = store.begin().unwrap();
        let versions = store
            .flush(
                tx,
                vec![FlushOp::Update {
                    oid: oid(1),
                    values: vec![(0, "Bea".into())],
                    expected: Some(v1),
                }],
            )
            .unwrap();
        assert_eq!(versions, vec![(oid(1), Version::Counter(2))]);
        store.commit(tx).unwrap();
        let row = store.load(None, &oid(1)).unwrap().unwrap();
        assert_eq!(row.values[0], FieldValue::string("Bea"));
    }

    #[test]
    fn test_stale_expected_version_conflicts_at_flush() {
        let store = InMemoryStore::new();
        insert(&store, 1, "Ann");
        let tx = store.begin().unwrap();
        let err = store
            .flush(
                tx,
                vec![FlushOp::CheckVersion {
                    oid: oid(1),
                    expected: Version::Counter(7),
                }],
            )
            .unwrap_err();
        assert!(err.is_optimistic());
        assert_eq!(err.failed_objects().len(), 1);
    }

    #[test]
    fn test_first_committer_wins() {
        let store = InMemoryStore::new();
        let v1 = insert(&store, 1, "Ann");
        let update = |name: &str| FlushOp::Update {
            oid: oid(1),
            values: vec![(0, name.into())],
            expected: Some(v1.clone()),
        };
        let a = store.begin().unwrap();
        let b = store.begin().unwrap();
        store.flush(a, vec![update("A")]).unwrap();
        store.flush(b, vec![update("B")]).unwrap();
        store.commit(a).unwrap();
        assert!(store.commit(b).unwrap_err().is_optimistic());
        let row = store.load(None, &oid(1)).unwrap().unwrap();
        assert_eq!(row.values[0], FieldValue::string("A"));
    }

    #[test]
    fn test_duplicate_insert_is_user_error() {
        let store = InMemoryStore::new();
        insert(&store, 1, "Ann");
        let tx = store.begin().unwrap();
        let err = store
            .flush(
                tx,
                vec![FlushOp::Insert {
                    oid: oid(1),
                    values: vec![],
                }],
            )
            .unwrap_err();
        assert!(matches!(err, SteadError::User { .. }));
    }

    #[test]
    fn test_rollback_discards_overlay() {
        let store = InMemoryStore::new();
        insert(&store, 1, "Ann");
        let tx = store.begin().unwrap();
        store
            .flush(
                tx,
                vec![FlushOp::Delete {
                    oid: oid(1),
                    expected: None,
                }],
            )
            .unwrap();
        assert!(!store.exists(Some(tx), &oid(1)).unwrap());
        store.rollback(tx).unwrap();
        assert!(store.exists(None, &oid(1)).unwrap());
    }

    #[test]
    fn test_assign_application_identity_from_keys() {
        let store = InMemoryStore::new();
        let meta = ClassMetaData::builder("Order")
            .field(FieldMetaData::new("code", TypeCode::String).primary_key())
            .application_identity()
            .build()
            .unwrap();
        let blank = Record::new(meta.clone());
        assert_eq!(store.assign_object_id(&meta, &blank).unwrap(), None);
        let keyed = Record::new(meta.clone()).with("code", "A1");
        assert_eq!(
            store.assign_object_id(&meta, &keyed).unwrap(),
            Some(ObjectId::application("Order", vec![IdValue::String("A1".into())]))
        );
    }
}
