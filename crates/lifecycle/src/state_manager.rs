//! The per-instance state manager contract
//!
//! Every instance the runtime knows about is reached through an
//! [`OpenStateManager`]: managed instances through
//! [`StateManagerImpl`](crate::StateManagerImpl), detached ones through
//! [`DetachedStateManager`](crate::DetachedStateManager), and so on. All
//! field mutation passes through it.

use crate::field_manager::FieldManager;
use crate::pc_state::PCState;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stead_core::{
    ClassMetaData, FailedObject, FieldSet, FieldValue, ObjectId, Oref, PersistenceCapable,
    SteadResult, Version,
};

/// Implementation-private data attached to a state manager
pub type ImplData = Box<dyn Any + Send + Sync>;

/// Why a field is being set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetKind {
    /// Application code assigned the field
    User,
    /// Attach copied the value from a detached instance
    Attach,
    /// Rollback restored a saved value
    Restore,
    /// Another context pushed the value
    Remote,
    /// Inverse management corrected the field
    Inverse,
}

/// Which fields are snapshotted for restore on rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreState {
    /// Nothing is restored; rolled-back instances become hollow
    None,
    /// Immutable (non-container) fields are restored
    #[default]
    Immutable,
    /// Every field is restored
    All,
}

/// Transaction facts shared between a persistence context and its state
/// managers. The context flips `active`; everything else is fixed when the
/// context is created.
#[derive(Debug)]
pub struct ContextFlags {
    active: AtomicBool,
    /// Optimistic transactions
    pub optimistic: bool,
    /// Reads allowed outside transactions
    pub nontransactional_read: bool,
    /// Writes allowed outside transactions
    pub nontransactional_write: bool,
    /// Keep field values across commit
    pub retain_state: bool,
    /// Snapshot policy for rollback
    pub restore_state: RestoreState,
}

impl ContextFlags {
    /// Flags with no transaction active
    pub fn new(
        optimistic: bool,
        nontransactional_read: bool,
        nontransactional_write: bool,
        retain_state: bool,
        restore_state: RestoreState,
    ) -> Arc<Self> {
        Arc::new(ContextFlags {
            active: AtomicBool::new(false),
            optimistic,
            nontransactional_read,
            nontransactional_write,
            retain_state,
            restore_state,
        })
    }

    /// Whether a transaction is active
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark a transaction as begun or ended
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }
}

impl Default for ContextFlags {
    fn default() -> Self {
        ContextFlags {
            active: AtomicBool::new(false),
            optimistic: true,
            nontransactional_read: true,
            nontransactional_write: true,
            retain_state: true,
            restore_state: RestoreState::Immutable,
        }
    }
}

/// Supplies permanent object ids
pub trait ObjectIdAssigner {
    /// Permanent id for `pc`, or `None` when one can only be produced by
    /// flushing first
    fn assign(&mut self, meta: &ClassMetaData, pc: &dyn PersistenceCapable)
        -> SteadResult<Option<ObjectId>>;
}

/// Per-instance state and field access
pub trait OpenStateManager {
    /// Flavor name, used in diagnostics
    fn manager_name(&self) -> &'static str;

    /// Class metadata
    fn meta(&self) -> &Arc<ClassMetaData>;

    /// The instance
    fn pc(&self) -> &dyn PersistenceCapable;

    /// Persistent identity, if known
    fn object_id(&self) -> Option<&ObjectId>;

    /// Assign a permanent identity. `Ok(false)` means a flush is required
    /// before one can be assigned.
    fn assign_object_id(&mut self, assigner: &mut dyn ObjectIdAssigner) -> SteadResult<bool>;

    /// Version token; `None` when the instance has none
    fn version(&self) -> Option<&Version>;

    /// Replace the version token
    fn set_version(&mut self, version: Option<Version>) -> SteadResult<()>;

    /// Current lifecycle phase; `None` for managers outside the state machine
    fn pc_state(&self) -> Option<PCState>;

    /// Fields resident in memory
    fn loaded(&self) -> &FieldSet;

    /// Fields changed since the last flush
    fn dirty(&self) -> &FieldSet;

    /// Fields whose changes were flushed this transaction
    fn flushed(&self) -> &FieldSet;

    /// Owner and owning field index, for embedded instances
    fn owner(&self) -> Option<(Oref, usize)>;

    /// Whether this manager represents a detached instance
    fn is_detached(&self) -> bool;

    /// Whether flushing must validate the version
    fn is_version_check_required(&self) -> bool;

    /// Whether flushing must produce a new version
    fn is_version_update_required(&self) -> bool;

    /// Called before a field is read; fails for fields that cannot be read
    fn accessing_field(&self, index: usize) -> SteadResult<()>;

    /// Raw field value, bypassing externalizers
    fn fetch_field(&self, index: usize) -> SteadResult<FieldValue>;

    /// Raw field write, bypassing factories and dirty tracking
    fn store_field(&mut self, index: usize, value: FieldValue) -> SteadResult<()>;

    /// Write path for a field setter: `current` is the value before the
    /// write, `next` the value being assigned. Returns whether the value
    /// was stored.
    fn setting_field(
        &mut self,
        index: usize,
        current: &FieldValue,
        next: FieldValue,
        kind: SetKind,
    ) -> SteadResult<bool>;

    /// Mark a field dirty without changing it (in-place mutation of a
    /// second-class value)
    fn dirty_field(&mut self, index: usize) -> SteadResult<()>;

    /// Per-instance private data
    fn impl_data(&self) -> Option<&(dyn Any + Send + Sync)>;

    /// Replace per-instance private data, returning the previous value
    fn set_impl_data(&mut self, data: Option<ImplData>) -> SteadResult<Option<ImplData>>;

    /// Per-field private data
    fn field_impl_data(&self, index: usize) -> Option<&(dyn Any + Send + Sync)>;

    /// Replace per-field private data, returning the previous value
    fn set_field_impl_data(&mut self, index: usize, data: Option<ImplData>)
        -> SteadResult<Option<ImplData>>;

    // =========================================================================
    // Derived
    // =========================================================================

    /// Field value after applying the field's externalizer
    fn fetch(&self, index: usize) -> SteadResult<FieldValue> {
        let value = self.fetch_field(index)?;
        match self.meta().require_field(index)?.converter.as_ref() {
            Some(conv) => conv.externalize(value),
            None => Ok(value),
        }
    }

    /// Store an external value after applying the field's factory
    fn store(&mut self, index: usize, value: FieldValue) -> SteadResult<()> {
        let value = match self.meta().require_field(index)?.converter.clone() {
            Some(conv) => conv.factory(value)?,
            None => value,
        };
        self.store_field(index, value)
    }

    /// Push field `index` into `fm`
    fn provide_field(&self, fm: &mut dyn FieldManager, index: usize) -> SteadResult<()> {
        fm.store_field(index, self.fetch_field(index)?)
    }

    /// Pull field `index` out of `fm`
    fn replace_field(&mut self, fm: &mut dyn FieldManager, index: usize) -> SteadResult<()> {
        let value = fm.fetch_field(index)?;
        self.store_field(index, value)
    }

    /// Participates in the current transaction
    fn is_transactional(&self) -> bool {
        self.pc_state().map_or(false, PCState::is_transactional)
    }

    /// Represents a stored instance
    fn is_persistent(&self) -> bool {
        self.pc_state().map_or(false, PCState::is_persistent)
    }

    /// Persisted in the current transaction
    fn is_new(&self) -> bool {
        self.pc_state().map_or(false, PCState::is_new)
    }

    /// Deleted in the current transaction
    fn is_deleted(&self) -> bool {
        self.pc_state().map_or(false, PCState::is_deleted)
    }

    /// Has unsaved changes
    fn is_dirty(&self) -> bool {
        self.pc_state().map_or(false, PCState::is_dirty)
    }

    /// Persisted provisionally
    fn is_provisional(&self) -> bool {
        self.pc_state().map_or(false, PCState::is_provisional)
    }

    /// Embedded in an owner
    fn is_embedded(&self) -> bool {
        self.owner().is_some()
    }

    /// Whether any change was flushed this transaction
    fn is_flushed(&self) -> bool {
        !self.flushed().is_empty()
    }

    /// Diagnostic description for error reporting
    fn failed_object(&self, oref: Option<Oref>) -> FailedObject {
        FailedObject::new(self.meta().name(), oref, self.object_id().cloned())
    }
}
