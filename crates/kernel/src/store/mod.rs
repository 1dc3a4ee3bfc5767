//! Store contract
//!
//! The broker never touches storage directly. Everything it needs from the
//! datastore (transaction demarcation, row loads, flushing changes,
//! identity assignment, version comparison) goes through [`StoreManager`].
//! Rows cross this boundary with relations expressed as
//! [`FieldValue::ObjectId`], never as heap handles.

mod memory;

pub use memory::InMemoryStore;

use stead_core::{
    ClassMetaData, FieldValue, ObjectId, PersistenceCapable, SteadResult, Version,
    VersionOrdering,
};

/// Store-side transaction handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreTxId(pub u64);

/// One stored instance: a value per field, plus its version
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    /// Field values in declaration order
    pub values: Vec<FieldValue>,
    /// Current version
    pub version: Version,
}

/// Change sent to the store at flush
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOp {
    /// New row; fails if the id already exists
    Insert {
        /// Identity of the new row
        oid: ObjectId,
        /// Every field value
        values: Vec<FieldValue>,
    },
    /// Change some fields of an existing row
    Update {
        /// Row to change
        oid: ObjectId,
        /// Changed fields
        values: Vec<(usize, FieldValue)>,
        /// Version the change was based on; `None` skips the check
        expected: Option<Version>,
    },
    /// Remove a row
    Delete {
        /// Row to remove
        oid: ObjectId,
        /// Version the delete was based on; `None` skips the check
        expected: Option<Version>,
    },
    /// Validate a version without writing
    CheckVersion {
        /// Row to validate
        oid: ObjectId,
        /// Version that must still be current
        expected: Version,
    },
}

impl FlushOp {
    /// Identity the operation targets
    pub fn oid(&self) -> &ObjectId {
        match self {
            FlushOp::Insert { oid, .. }
            | FlushOp::Update { oid, .. }
            | FlushOp::Delete { oid, .. }
            | FlushOp::CheckVersion { oid, .. } => oid,
        }
    }
}

/// Datastore access used by the broker
pub trait StoreManager: Send + Sync {
    /// Start a store transaction
    fn begin(&self) -> SteadResult<StoreTxId>;

    /// Validate and apply everything flushed under `tx`. Returns the ids
    /// that were written or deleted.
    fn commit(&self, tx: StoreTxId) -> SteadResult<Vec<ObjectId>>;

    /// Discard everything flushed under `tx`
    fn rollback(&self, tx: StoreTxId) -> SteadResult<()>;

    /// Whether a row exists, as seen from `tx` (or committed state)
    fn exists(&self, tx: Option<StoreTxId>, oid: &ObjectId) -> SteadResult<bool>;

    /// Row for `oid`, as seen from `tx` (or committed state)
    fn load(&self, tx: Option<StoreTxId>, oid: &ObjectId) -> SteadResult<Option<StoredRow>>;

    /// Apply `ops` under `tx`, all or nothing. Returns the new version of
    /// every inserted or updated row.
    fn flush(&self, tx: StoreTxId, ops: Vec<FlushOp>) -> SteadResult<Vec<(ObjectId, Version)>>;

    /// Permanent identity for a new instance; `None` when one can only be
    /// produced by flushing
    fn assign_object_id(
        &self,
        meta: &ClassMetaData,
        pc: &dyn PersistenceCapable,
    ) -> SteadResult<Option<ObjectId>>;

    /// How `a` relates to `b`
    fn compare_version(&self, a: &Version, b: &Version) -> VersionOrdering {
        a.compare(b)
    }
}
