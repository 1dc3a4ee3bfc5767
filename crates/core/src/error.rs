//! Error types for the persistence runtime
//!
//! All layers share [`SteadError`]. Variants follow the failure taxonomy of
//! the lifecycle core:
//!
//! - state violations ([`SteadError::InvalidState`], [`SteadError::UnloadedDetached`])
//! - optimistic conflicts ([`SteadError::Optimistic`]), kept distinct so callers
//!   can retry the transaction
//! - user-input failures ([`SteadError::User`], [`SteadError::ObjectNotFound`])
//! - contract violations ([`SteadError::Unsupported`], [`SteadError::Internal`])
//! - aggregates from bulk detach/attach ([`SteadError::Nested`])
//!
//! We use `thiserror` for `Display` and `Error`.

use crate::types::{FailedObject, ObjectId};
use thiserror::Error;

/// Result type alias for runtime operations
pub type SteadResult<T> = std::result::Result<T, SteadError>;

/// Error type for the persistence runtime
#[derive(Debug, Error)]
pub enum SteadError {
    /// Operation not legal in the current lifecycle state
    #[error("Invalid state: {message}")]
    InvalidState {
        /// What went wrong
        message: String,
        /// Offending instance
        failed: Option<FailedObject>,
        /// Fatal errors leave the context unusable for the current transaction
        fatal: bool,
    },

    /// Version conflict
    #[error("Optimistic conflict: {message}")]
    Optimistic {
        /// What went wrong
        message: String,
        /// Conflicting instances
        failed: Vec<FailedObject>,
    },

    /// No instance with the given id exists in the store
    #[error("Object not found: {oid}")]
    ObjectNotFound {
        /// Missing id
        oid: ObjectId,
    },

    /// Invalid user input; aborts the operation but not the context
    #[error("{message}")]
    User {
        /// What went wrong
        message: String,
        /// Offending instance
        failed: Option<FailedObject>,
    },

    /// Operation not meaningful for this state manager flavor
    #[error("Unsupported operation {operation} on {manager}")]
    Unsupported {
        /// Operation name
        operation: &'static str,
        /// State manager flavor
        manager: &'static str,
    },

    /// Read of a field that was not captured when the instance was detached
    #[error("Field {class}.{field} was not loaded when the instance was detached")]
    UnloadedDetached {
        /// Class name
        class: String,
        /// Field name
        field: String,
    },

    /// A lifecycle listener failed
    #[error("Callback for {event} failed: {message}")]
    Callback {
        /// Event name
        event: String,
        /// Listener message
        message: String,
    },

    /// Several failures collected during a bulk operation
    #[error("{message} ({} nested)", .causes.len())]
    Nested {
        /// Summary
        message: String,
        /// Collected causes, in encounter order
        causes: Vec<SteadError>,
    },

    /// Store collaborator failure
    #[error("Store error: {0}")]
    Store(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Broken internal invariant; indicates a bug
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SteadError {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Fatal invalid-state error about an instance
    pub fn invalid_state(message: impl Into<String>, failed: Option<FailedObject>) -> Self {
        SteadError::InvalidState {
            message: message.into(),
            failed,
            fatal: true,
        }
    }

    /// Non-fatal invalid-state error
    pub fn invalid_state_recoverable(message: impl Into<String>) -> Self {
        SteadError::InvalidState {
            message: message.into(),
            failed: None,
            fatal: false,
        }
    }

    /// Optimistic conflict on a single instance
    pub fn optimistic(message: impl Into<String>, failed: FailedObject) -> Self {
        SteadError::Optimistic {
            message: message.into(),
            failed: vec![failed],
        }
    }

    /// User error
    pub fn user(message: impl Into<String>) -> Self {
        SteadError::User {
            message: message.into(),
            failed: None,
        }
    }

    /// User error about an instance
    pub fn user_with(message: impl Into<String>, failed: FailedObject) -> Self {
        SteadError::User {
            message: message.into(),
            failed: Some(failed),
        }
    }

    /// Unsupported operation
    pub fn unsupported(operation: &'static str, manager: &'static str) -> Self {
        SteadError::Unsupported { operation, manager }
    }

    /// Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        SteadError::Internal(message.into())
    }

    /// Store error
    pub fn store(message: impl Into<String>) -> Self {
        SteadError::Store(message.into())
    }

    /// Aggregate of collected failures, even when there is only one
    pub fn nested(message: impl Into<String>, causes: Vec<SteadError>) -> Self {
        SteadError::Nested {
            message: message.into(),
            causes,
        }
    }

    /// Fold failures collected by a bulk operation into one error.
    ///
    /// Returns `None` for an empty list and the sole error for a list of
    /// one. When every cause is an optimistic conflict the result is an
    /// [`SteadError::Optimistic`] carrying the union of failed objects, so
    /// callers can keep treating the batch as retryable.
    pub fn collect(message: impl Into<String>, mut causes: Vec<SteadError>) -> Option<Self> {
        match causes.len() {
            0 => None,
            1 => causes.pop(),
            _ => {
                if causes.iter().all(|e| e.is_optimistic()) {
                    let failed = causes
                        .iter()
                        .flat_map(|e| e.failed_objects().into_iter().cloned())
                        .collect();
                    Some(SteadError::Optimistic {
                        message: message.into(),
                        failed,
                    })
                } else {
                    Some(SteadError::Nested {
                        message: message.into(),
                        causes,
                    })
                }
            }
        }
    }

    // =========================================================================
    // Classification
    // =========================================================================

    /// Whether the error leaves the current transaction unusable
    pub fn is_fatal(&self) -> bool {
        match self {
            SteadError::InvalidState { fatal, .. } => *fatal,
            SteadError::Unsupported { .. } | SteadError::Internal(_) => true,
            SteadError::Nested { causes, .. } => causes.iter().any(|c| c.is_fatal()),
            _ => false,
        }
    }

    /// Whether this is an optimistic concurrency conflict
    pub fn is_optimistic(&self) -> bool {
        matches!(self, SteadError::Optimistic { .. })
    }

    /// Whether retrying the whole transaction may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SteadError::Optimistic { .. } => true,
            SteadError::Nested { causes, .. } => causes.iter().all(|c| c.is_retryable()),
            _ => false,
        }
    }

    /// Instances this error is about
    pub fn failed_objects(&self) -> Vec<&FailedObject> {
        match self {
            SteadError::InvalidState { failed, .. } | SteadError::User { failed, .. } => {
                failed.iter().collect()
            }
            SteadError::Optimistic { failed, .. } => failed.iter().collect(),
            SteadError::Nested { causes, .. } => {
                causes.iter().flat_map(|c| c.failed_objects()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Nested causes of an aggregate; empty otherwise
    pub fn causes(&self) -> &[SteadError] {
        match self {
            SteadError::Nested { causes, .. } => causes,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(class: &str) -> FailedObject {
        FailedObject::new(class, None, None)
    }

    #[test]
    fn test_invalid_state_is_fatal() {
        let err = SteadError::invalid_state("write to deleted", Some(failed("Person")));
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert_eq!(err.failed_objects().len(), 1);
        assert!(err.to_string().contains("write to deleted"));
    }

    #[test]
    fn test_optimistic_is_retryable() {
        let err = SteadError::optimistic("stale", failed("Person"));
        assert!(err.is_optimistic());
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_collect_empty_and_single() {
        assert!(SteadError::collect("batch", Vec::new()).is_none());
        let single = SteadError::collect("batch", vec![SteadError::user("bad")]).unwrap();
        assert!(matches!(single, SteadError::User { .. }));
    }

    #[test]
    fn test_collect_mixed_is_nested() {
        let err = SteadError::collect(
            "batch",
            vec![
                SteadError::user("bad"),
                SteadError::optimistic("stale", failed("A")),
            ],
        )
        .unwrap();
        assert_eq!(err.causes().len(), 2);
        assert!(err.to_string().contains("2 nested"));
    }

    #[test]
    fn test_collect_all_optimistic_stays_optimistic() {
        let err = SteadError::collect(
            "batch",
            vec![
                SteadError::optimistic("stale", failed("A")),
                SteadError::optimistic("stale", failed("B")),
            ],
        )
        .unwrap();
        assert!(err.is_optimistic());
        assert_eq!(err.failed_objects().len(), 2);
    }

    #[test]
    fn test_nested_wraps_single_cause() {
        let err = SteadError::nested("detach failed", vec![SteadError::user("bad")]);
        assert_eq!(err.causes().len(), 1);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_unsupported_display() {
        let err = SteadError::unsupported("set_version", "DetachedValueStateManager");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("set_version"));
    }
}
