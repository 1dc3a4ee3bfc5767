//! Lifecycle events and per-operation callbacks

use rustc_hash::FxHashSet;
use std::fmt;
use std::sync::Arc;
use stead_core::{CascadeOp, ObjectId, Oref, SteadError, SteadResult};

/// Lifecycle event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Before an instance is persisted
    BeforePersist,
    /// After an instance is persisted
    AfterPersist,
    /// Before an instance is deleted
    BeforeDelete,
    /// After an instance is deleted
    AfterDelete,
    /// Before an instance's changes are flushed
    BeforeStore,
    /// After an instance's changes are flushed
    AfterStore,
    /// Before the first change to a clean instance
    BeforeDirty,
    /// After the first change to a clean instance
    AfterDirty,
    /// After fields are loaded from the store
    AfterLoad,
    /// Before an instance is detached
    BeforeDetach,
    /// After an instance is detached
    AfterDetach,
    /// Before an instance is attached
    BeforeAttach,
    /// After an instance is attached
    AfterAttach,
    /// After the transaction commits
    AfterCommit,
    /// After the transaction rolls back
    AfterRollback,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One lifecycle notification
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    /// What happened
    pub kind: EventKind,
    /// Instance the event is about; `None` for transaction events
    pub oref: Option<Oref>,
    /// Class of the instance
    pub class: Option<String>,
    /// Identity of the instance, if known
    pub oid: Option<ObjectId>,
    /// For detach and attach: the instance on the other side
    pub related: Option<Oref>,
}

impl LifecycleEvent {
    /// Event about an instance
    pub fn instance(kind: EventKind, oref: Oref, class: &str, oid: Option<ObjectId>) -> Self {
        LifecycleEvent {
            kind,
            oref: Some(oref),
            class: Some(class.to_string()),
            oid,
            related: None,
        }
    }

    /// Event about the transaction
    pub fn transaction(kind: EventKind) -> Self {
        LifecycleEvent {
            kind,
            oref: None,
            class: None,
            oid: None,
            related: None,
        }
    }

    /// Attach the counterpart instance
    pub fn with_related(mut self, related: Oref) -> Self {
        self.related = Some(related);
        self
    }
}

/// Listener callback; an `Err` aborts or is collected per callback mode
pub type ListenerFn = dyn Fn(&LifecycleEvent) -> Result<(), String> + Send + Sync;

#[derive(Clone)]
struct Registration {
    kinds: Option<FxHashSet<EventKind>>,
    listener: Arc<ListenerFn>,
}

/// Ordered set of lifecycle listeners
#[derive(Clone, Default)]
pub struct LifecycleListeners {
    entries: Vec<Registration>,
}

impl fmt::Debug for LifecycleListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleListeners")
            .field("count", &self.entries.len())
            .finish()
    }
}

impl LifecycleListeners {
    /// No listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen to every event
    pub fn add(&mut self, listener: Arc<ListenerFn>) {
        self.entries.push(Registration {
            kinds: None,
            listener,
        });
    }

    /// Listen to the given kinds only
    pub fn add_for(&mut self, kinds: &[EventKind], listener: Arc<ListenerFn>) {
        self.entries.push(Registration {
            kinds: Some(kinds.iter().copied().collect()),
            listener,
        });
    }

    /// Append every listener of `other`
    pub fn extend(&mut self, other: &LifecycleListeners) {
        self.entries.extend(other.entries.iter().cloned());
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether any listener wants `kind`
    pub fn has_listeners(&self, kind: EventKind) -> bool {
        self.entries
            .iter()
            .any(|r| r.kinds.as_ref().map_or(true, |k| k.contains(&kind)))
    }

    /// Deliver `event` in registration order, stopping at the first failure
    pub fn fire(&self, event: &LifecycleEvent) -> SteadResult<()> {
        for reg in &self.entries {
            if reg.kinds.as_ref().map_or(false, |k| !k.contains(&event.kind)) {
                continue;
            }
            (reg.listener)(event).map_err(|message| SteadError::Callback {
                event: event.kind.to_string(),
                message,
            })?;
        }
        Ok(())
    }
}

/// What to do with one argument of a detach or attach call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpActions {
    /// Process the instance itself
    pub run: bool,
    /// Follow its relations
    pub cascade: bool,
}

impl OpActions {
    /// Process and cascade
    pub const ALL: OpActions = OpActions {
        run: true,
        cascade: true,
    };

    /// Leave the instance alone
    pub const SKIP: OpActions = OpActions {
        run: false,
        cascade: false,
    };
}

/// Per-operation filter consulted for every instance a detach or attach
/// reaches
pub trait OpCallbacks {
    /// Actions for `oref` under operation `op`
    fn process_argument(&self, op: CascadeOp, oref: Oref) -> OpActions;
}

impl<F> OpCallbacks for F
where
    F: Fn(CascadeOp, Oref) -> OpActions,
{
    fn process_argument(&self, op: CascadeOp, oref: Oref) -> OpActions {
        self(op, oref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_listener_filtering_and_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut listeners = LifecycleListeners::new();
        let s = Arc::clone(&seen);
        listeners.add_for(
            &[EventKind::AfterCommit],
            Arc::new(move |e: &LifecycleEvent| {
                s.lock().push(("commit-only", e.kind));
                Ok(())
            }),
        );
        let s = Arc::clone(&seen);
        listeners.add(Arc::new(move |e: &LifecycleEvent| {
            s.lock().push(("all", e.kind));
            Ok(())
        }));
        listeners
            .fire(&LifecycleEvent::transaction(EventKind::AfterRollback))
            .unwrap();
        listeners
            .fire(&LifecycleEvent::transaction(EventKind::AfterCommit))
            .unwrap();
        assert_eq!(
            *seen.lock(),
            vec![
                ("all", EventKind::AfterRollback),
                ("commit-only", EventKind::AfterCommit),
                ("all", EventKind::AfterCommit),
            ]
        );
        assert!(listeners.has_listeners(EventKind::BeforeDetach));
    }

    #[test]
    fn test_failure_becomes_callback_error() {
        let mut listeners = LifecycleListeners::new();
        listeners.add(Arc::new(|_: &LifecycleEvent| Err("boom".to_string())));
        let err = listeners
            .fire(&LifecycleEvent::transaction(EventKind::AfterCommit))
            .unwrap_err();
        assert!(matches!(err, SteadError::Callback { ref message, .. } if message == "boom"));
    }

    #[test]
    fn test_closure_op_callbacks() {
        let skip = Oref::new(3, 0);
        let cb = move |_: CascadeOp, o: Oref| if o == skip { OpActions::SKIP } else { OpActions::ALL };
        assert_eq!(cb.process_argument(CascadeOp::Detach, skip), OpActions::SKIP);
        assert!(cb.process_argument(CascadeOp::Detach, Oref::new(1, 0)).run);
    }
}
