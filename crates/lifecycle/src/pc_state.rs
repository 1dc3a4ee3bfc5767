//! Lifecycle state machine
//!
//! [`PCState`] is a closed set of lifecycle phases. Each phase answers, as a
//! pure function of a [`Transition`], which phase comes next; unchanged
//! phases return themselves. Side effects are never performed here: the
//! [`PCState::before_flush`] and [`PCState::initialize`] hooks only *describe*
//! what the owning state manager must do ([`FlushAction`], [`StateEffect`]).
//!
//! Phases are plain `Copy` values, so equality is identity and a
//! serialize/deserialize round trip always yields the same phase.

use serde::{Deserialize, Serialize};
use stead_core::{SteadError, SteadResult};
use std::fmt;

/// Lifecycle phase of a managed instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PCState {
    /// Not managed
    Transient,
    /// Transactional but not persistent, unchanged
    TransientClean,
    /// Transactional but not persistent, changed
    TransientDirty,
    /// Not managed, fields populated from a load
    TransientLoaded,
    /// Persisted in the current transaction
    New,
    /// Persisted by reachability; confirmed or dropped at flush
    NewProvisional,
    /// Persisted then deleted before any flush
    NewDeleted,
    /// Persisted, flushed, then deleted
    NewFlushedDeleted,
    /// Persisted, flushed, deleted, and the delete flushed
    NewFlushedDeletedFlushed,
    /// Persistent, transactional, unchanged
    Clean,
    /// Persistent, transactional, changed
    Dirty,
    /// Persistent, deleted in the current transaction
    Deleted,
    /// Deleted and the delete flushed
    DeletedFlushed,
    /// Persistent, read outside a transaction
    NonTransactional,
    /// Persistent, changed outside a transaction
    NonTransactionalDirty,
    /// Persisted outside a transaction
    NonTransactionalNew,
    /// Deleted outside a transaction
    NonTransactionalDeleted,
    /// Persistent, nothing loaded
    Hollow,
    /// Embedded copy not bound to an owner's transaction
    EmbeddedCopy,
    /// Embedded, transactional, unchanged
    EmbeddedClean,
    /// Embedded, transactional, changed
    EmbeddedDirty,
    /// Embedded, owner deleted
    EmbeddedDeleted,
    /// Embedded, read outside a transaction
    EmbeddedNonTransactional,
}

/// Lifecycle event driving a [`PCState`] transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transition {
    /// Persist inside a transaction
    Persist,
    /// Persist outside a transaction (non-transactional write)
    PersistNontransactional,
    /// Delete
    Delete,
    /// Changes sent to the store
    Flush,
    /// Commit without retaining field values
    Commit,
    /// Commit retaining field values
    CommitRetain,
    /// Rollback discarding field values
    Rollback,
    /// Rollback restoring pre-transaction field values
    RollbackRestore,
    /// Enlist in the current transaction
    Transactional,
    /// Leave the current transaction
    Nontransactional,
    /// Stop managing the instance
    Release,
    /// Drop loaded field values
    Evict,
    /// Reload field values from the store
    Refresh,
    /// Read inside a pessimistic transaction
    BeforeRead,
    /// Read inside an optimistic transaction
    BeforeOptimisticRead,
    /// Read outside a transaction
    BeforeNontransactionalRead,
    /// Write inside a pessimistic transaction
    BeforeWrite,
    /// Write inside an optimistic transaction
    BeforeOptimisticWrite,
    /// Write outside a transaction
    BeforeNontransactionalWrite,
    /// A provisional instance is confirmed reachable
    Nonprovisional,
}

/// Instance facts a few transitions depend on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionContext {
    /// A transaction is active on the owning context
    pub active: bool,
    /// The instance has been flushed in the current transaction
    pub flushed: bool,
}

/// Work the state manager performs before the instance is flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushAction {
    /// Nothing to do
    None,
    /// Cascade persist over relations and confirm provisional references
    CascadePersist,
    /// Release dependent references held by a deleted instance
    DereferenceDependent,
}

/// Work the state manager performs on entering a new phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEffect {
    /// Nothing to do
    None,
    /// Unload every non-key field
    ClearFields,
    /// Snapshot loaded field values for a later restore
    SaveFields,
    /// Put saved field values back
    RestoreFields,
    /// Detach the state manager from the instance
    Release,
}

impl PCState {
    /// Every phase, in declaration order
    pub const ALL: [PCState; 23] = [
        PCState::Transient,
        PCState::TransientClean,
        PCState::TransientDirty,
        PCState::TransientLoaded,
        PCState::New,
        PCState::NewProvisional,
        PCState::NewDeleted,
        PCState::NewFlushedDeleted,
        PCState::NewFlushedDeletedFlushed,
        PCState::Clean,
        PCState::Dirty,
        PCState::Deleted,
        PCState::DeletedFlushed,
        PCState::NonTransactional,
        PCState::NonTransactionalDirty,
        PCState::NonTransactionalNew,
        PCState::NonTransactionalDeleted,
        PCState::Hollow,
        PCState::EmbeddedCopy,
        PCState::EmbeddedClean,
        PCState::EmbeddedDirty,
        PCState::EmbeddedDeleted,
        PCState::EmbeddedNonTransactional,
    ];

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Successor phase for `event`.
    ///
    /// Errors are the defined outcome for illegal events: writing to or
    /// persisting a deleted instance is a fatal invalid-state error,
    /// deleting a non-persistent instance is a user error, and leaving the
    /// transaction while dirty is a recoverable invalid-state error.
    pub fn transition(self, event: Transition, ctx: TransitionContext) -> SteadResult<PCState> {
        use PCState::*;
        use Transition::*;

        if self.is_deleted() {
            match event {
                Persist | PersistNontransactional => return Err(self.error("persist-deleted")),
                BeforeWrite | BeforeOptimisticWrite | BeforeNontransactionalWrite => {
                    return Err(self.error("write-deleted"))
                }
                _ => {}
            }
        }

        let next = match (self, event) {
            // transient family
            (Transient | TransientLoaded | TransientClean | TransientDirty, Persist) => New,
            (Transient | TransientLoaded, PersistNontransactional) => NonTransactionalNew,
            (TransientClean | TransientDirty, PersistNontransactional) => New,
            (Transient | TransientLoaded | TransientClean | TransientDirty | EmbeddedCopy, Delete) => {
                return Err(SteadError::user(format!(
                    "cannot delete an instance in state {}",
                    self
                )))
            }
            (Transient | TransientLoaded, Transactional) => TransientClean,
            (TransientLoaded, Release) => Transient,
            (
                TransientClean,
                BeforeWrite | BeforeOptimisticWrite | BeforeNontransactionalWrite,
            ) => TransientDirty,
            (TransientClean, Nontransactional | Release) => Transient,
            (TransientDirty, Commit | CommitRetain | Rollback | RollbackRestore) => TransientClean,

            // new family
            (New, Delete) if ctx.flushed => NewFlushedDeleted,
            (New, Delete) => NewDeleted,
            (New, Commit) => Hollow,
            (New, CommitRetain) => NonTransactional,
            (New | NewProvisional, Rollback | RollbackRestore) => Transient,
            (NewProvisional, Nonprovisional) => New,
            (NewProvisional, Delete) => Transient,
            (NewProvisional, Commit) => Hollow,
            (NewProvisional, CommitRetain) => NonTransactional,
            (NewDeleted | NewFlushedDeleted | NewFlushedDeletedFlushed, Commit | CommitRetain) => {
                Transient
            }
            (NewDeleted | NewFlushedDeleted | NewFlushedDeletedFlushed, Rollback | RollbackRestore) => {
                Transient
            }
            (NewFlushedDeleted, Flush) => NewFlushedDeletedFlushed,

            // persistent transactional
            (Clean | Dirty, Delete) => Deleted,
            (Clean | Dirty, Commit | Rollback) => Hollow,
            (Clean | Dirty, CommitRetain | RollbackRestore) => NonTransactional,
            (Clean, Nontransactional) => NonTransactional,
            (Clean, Release) => Transient,
            (Clean, Evict) => Hollow,
            (Clean, BeforeWrite | BeforeOptimisticWrite | BeforeNontransactionalWrite) => Dirty,
            (Dirty, Refresh) => Clean,
            (Deleted, Flush) => DeletedFlushed,
            (Deleted | DeletedFlushed, Commit | CommitRetain) => Transient,
            (Deleted | DeletedFlushed, Rollback) => Hollow,
            (Deleted | DeletedFlushed, RollbackRestore) => NonTransactional,

            // non-transactional
            (NonTransactional | Hollow, Delete) if ctx.active => Deleted,
            (NonTransactional | Hollow, Delete) => NonTransactionalDeleted,
            (NonTransactional | Hollow, Transactional | BeforeRead) => Clean,
            (NonTransactional | Hollow, Release) => Transient,
            (NonTransactional, Evict) => Hollow,
            (NonTransactional | Hollow, BeforeWrite | BeforeOptimisticWrite) => Dirty,
            (NonTransactional | Hollow, BeforeNontransactionalWrite) => NonTransactionalDirty,
            (Hollow, BeforeOptimisticRead | BeforeNontransactionalRead) => NonTransactional,
            (Hollow, Persist | PersistNontransactional) => New,
            (NonTransactionalDirty, Transactional | BeforeWrite | BeforeOptimisticWrite) => Dirty,
            (NonTransactionalDirty, Delete) if ctx.active => Deleted,
            (NonTransactionalDirty, Delete) => NonTransactionalDeleted,
            (NonTransactionalDirty, Commit | CommitRetain | Rollback | RollbackRestore) => {
                NonTransactional
            }
            (NonTransactionalNew, Transactional) => New,
            (NonTransactionalNew, Delete | Release) => Transient,
            (NonTransactionalDeleted, Transactional) => Deleted,

            // embedded
            (EmbeddedCopy, Release) => Transient,
            (EmbeddedCopy, Transactional) => EmbeddedClean,
            (EmbeddedClean | EmbeddedDirty, Delete) => EmbeddedDeleted,
            (EmbeddedNonTransactional, Delete) => EmbeddedDeleted,
            (
                EmbeddedClean | EmbeddedDirty,
                Commit | CommitRetain | Rollback | RollbackRestore,
            ) => EmbeddedNonTransactional,
            (EmbeddedClean, Nontransactional) => EmbeddedNonTransactional,
            (EmbeddedClean | EmbeddedNonTransactional, Release) => Transient,
            (EmbeddedClean, BeforeWrite | BeforeOptimisticWrite | BeforeNontransactionalWrite) => {
                EmbeddedDirty
            }
            (EmbeddedNonTransactional, BeforeWrite | BeforeOptimisticWrite) => EmbeddedDirty,
            (EmbeddedNonTransactional, Transactional) => EmbeddedClean,
            (EmbeddedDeleted, Commit | CommitRetain | Rollback | RollbackRestore) => Transient,

            // dirty transactional instances cannot leave the transaction
            (
                TransientDirty | New | NewProvisional | NewDeleted | NewFlushedDeleted
                | NewFlushedDeletedFlushed | Dirty | Deleted | DeletedFlushed | EmbeddedDirty
                | EmbeddedDeleted,
                Nontransactional | Release,
            ) => return Err(self.dirty_error(event)),
            (NonTransactionalDirty | NonTransactionalDeleted, Release) => {
                return Err(self.dirty_error(event))
            }

            (state, _) => state,
        };
        Ok(next)
    }

    fn error(self, key: &str) -> SteadError {
        SteadError::invalid_state(format!("{} in state {}", key, self), None)
    }

    fn dirty_error(self, event: Transition) -> SteadError {
        SteadError::invalid_state_recoverable(format!(
            "cannot apply {:?} to a changed instance in state {}",
            event, self
        ))
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    /// Work required before this instance is flushed
    pub fn before_flush(self) -> FlushAction {
        match self {
            PCState::New | PCState::NewProvisional | PCState::Dirty => FlushAction::CascadePersist,
            PCState::Deleted | PCState::NewFlushedDeleted => FlushAction::DereferenceDependent,
            _ => FlushAction::None,
        }
    }

    /// Work required on entering this phase from `previous` via `event`
    pub fn initialize(self, previous: PCState, event: Transition) -> StateEffect {
        if self == previous {
            return StateEffect::None;
        }
        if matches!(self, PCState::Transient | PCState::TransientLoaded) && previous.is_persistent()
        {
            return StateEffect::Release;
        }
        if self == PCState::Hollow {
            return StateEffect::ClearFields;
        }
        let rolling_back = match event {
            Transition::RollbackRestore => true,
            Transition::Rollback => previous == PCState::TransientDirty,
            _ => false,
        };
        if rolling_back && previous.is_dirty() {
            return StateEffect::RestoreFields;
        }
        if self.is_dirty() && !previous.is_dirty() && !self.is_new() {
            return StateEffect::SaveFields;
        }
        StateEffect::None
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Participates in the current transaction
    pub fn is_transactional(self) -> bool {
        use PCState::*;
        matches!(
            self,
            TransientClean
                | TransientDirty
                | New
                | NewProvisional
                | NewDeleted
                | NewFlushedDeleted
                | NewFlushedDeletedFlushed
                | Clean
                | Dirty
                | Deleted
                | DeletedFlushed
                | EmbeddedClean
                | EmbeddedDirty
                | EmbeddedDeleted
        )
    }

    /// Represents (or will represent) a stored instance
    pub fn is_persistent(self) -> bool {
        use PCState::*;
        !matches!(
            self,
            Transient | TransientClean | TransientDirty | TransientLoaded | EmbeddedCopy
        )
    }

    /// Persisted in the current transaction
    pub fn is_new(self) -> bool {
        use PCState::*;
        matches!(
            self,
            New | NewProvisional
                | NewDeleted
                | NewFlushedDeleted
                | NewFlushedDeletedFlushed
                | NonTransactionalNew
        )
    }

    /// Deleted in the current transaction
    pub fn is_deleted(self) -> bool {
        use PCState::*;
        matches!(
            self,
            NewDeleted
                | NewFlushedDeleted
                | NewFlushedDeletedFlushed
                | Deleted
                | DeletedFlushed
                | NonTransactionalDeleted
                | EmbeddedDeleted
        )
    }

    /// Has unsaved changes
    pub fn is_dirty(self) -> bool {
        use PCState::*;
        matches!(
            self,
            TransientDirty
                | New
                | NewProvisional
                | NewDeleted
                | NewFlushedDeleted
                | NewFlushedDeletedFlushed
                | Dirty
                | Deleted
                | DeletedFlushed
                | NonTransactionalDirty
                | NonTransactionalNew
                | NonTransactionalDeleted
                | EmbeddedDirty
                | EmbeddedDeleted
        )
    }

    /// Will become transactional when the next transaction begins
    pub fn is_pending_transactional(self) -> bool {
        matches!(
            self,
            PCState::NonTransactionalDirty
                | PCState::NonTransactionalNew
                | PCState::NonTransactionalDeleted
        )
    }

    /// Persisted provisionally; may revert at flush
    pub fn is_provisional(self) -> bool {
        self == PCState::NewProvisional
    }

    /// Embedded in an owner
    pub fn is_embedded(self) -> bool {
        use PCState::*;
        matches!(
            self,
            EmbeddedCopy | EmbeddedClean | EmbeddedDirty | EmbeddedDeleted | EmbeddedNonTransactional
        )
    }

    /// Whether flushing must validate the version
    pub fn is_version_check_required(self, flushed: bool) -> bool {
        match self {
            PCState::Dirty | PCState::Deleted => !flushed,
            _ => false,
        }
    }

    /// Whether every field may be read without a load in this phase
    pub fn is_loaded_on_enter(self) -> bool {
        self.is_new()
    }
}

impl fmt::Display for PCState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PCState::Transient => "TRANSIENT",
            PCState::TransientClean => "TCLEAN",
            PCState::TransientDirty => "TDIRTY",
            PCState::TransientLoaded => "TLOADED",
            PCState::New => "PNEW",
            PCState::NewProvisional => "PNEWPROVISIONAL",
            PCState::NewDeleted => "PNEWDELETED",
            PCState::NewFlushedDeleted => "PNEWFLUSHEDDELETED",
            PCState::NewFlushedDeletedFlushed => "PNEWFLUSHEDDELETEDFLUSHED",
            PCState::Clean => "PCLEAN",
            PCState::Dirty => "PDIRTY",
            PCState::Deleted => "PDELETED",
            PCState::DeletedFlushed => "PDELETEDFLUSHED",
            PCState::NonTransactional => "PNONTRANS",
            PCState::NonTransactionalDirty => "PNONTRANSDIRTY",
            PCState::NonTransactionalNew => "PNONTRANSNEW",
            PCState::NonTransactionalDeleted => "PNONTRANSDELETED",
            PCState::Hollow => "HOLLOW",
            PCState::EmbeddedCopy => "ECOPY",
            PCState::EmbeddedClean => "ECLEAN",
            PCState::EmbeddedDirty => "EDIRTY",
            PCState::EmbeddedDeleted => "EDELETED",
            PCState::EmbeddedNonTransactional => "ENONTRANS",
        };
        f.write_str(name)
    }
}

impl Transition {
    /// Every event
    pub const ALL: [Transition; 20] = [
        Transition::Persist,
        Transition::PersistNontransactional,
        Transition::Delete,
        Transition::Flush,
        Transition::Commit,
        Transition::CommitRetain,
        Transition::Rollback,
        Transition::RollbackRestore,
        Transition::Transactional,
        Transition::Nontransactional,
        Transition::Release,
        Transition::Evict,
        Transition::Refresh,
        Transition::BeforeRead,
        Transition::BeforeOptimisticRead,
        Transition::BeforeNontransactionalRead,
        Transition::BeforeWrite,
        Transition::BeforeOptimisticWrite,
        Transition::BeforeNontransactionalWrite,
        Transition::Nonprovisional,
    ];

    /// Read event matching the context's transaction mode
    pub fn read(active: bool, optimistic: bool) -> Transition {
        match (active, optimistic) {
            (false, _) => Transition::BeforeNontransactionalRead,
            (true, true) => Transition::BeforeOptimisticRead,
            (true, false) => Transition::BeforeRead,
        }
    }

    /// Write event matching the context's transaction mode
    pub fn write(active: bool, optimistic: bool) -> Transition {
        match (active, optimistic) {
            (false, _) => Transition::BeforeNontransactionalWrite,
            (true, true) => Transition::BeforeOptimisticWrite,
            (true, false) => Transition::BeforeWrite,
        }
    }
}
