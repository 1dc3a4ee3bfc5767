//! Totality and identity of the lifecycle state machine

use crate::common::*;
use proptest::prelude::*;
use stead::lifecycle::{Transition, TransitionContext};

fn contexts() -> [TransitionContext; 4] {
    [
        TransitionContext { active: false, flushed: false },
        TransitionContext { active: true, flushed: false },
        TransitionContext { active: false, flushed: true },
        TransitionContext { active: true, flushed: true },
    ]
}

#[test]
fn test_every_transition_is_defined() {
    for state in PCState::ALL {
        for event in Transition::ALL {
            for ctx in contexts() {
                match state.transition(event, ctx) {
                    Ok(next) => assert!(
                        PCState::ALL.contains(&next),
                        "{state} --{event:?}--> undocumented state"
                    ),
                    Err(e) => assert!(
                        matches!(e, SteadError::InvalidState { .. } | SteadError::User { .. }),
                        "{state} --{event:?}--> unexpected error {e:?}"
                    ),
                }
            }
        }
    }
}

#[test]
fn test_transitions_are_deterministic() {
    for state in PCState::ALL {
        for event in Transition::ALL {
            let ctx = TransitionContext { active: true, flushed: false };
            let a = state.transition(event, ctx).ok();
            let b = state.transition(event, ctx).ok();
            assert_eq!(a, b);
        }
    }
}

#[test]
fn test_json_round_trip_keeps_identity() {
    for state in PCState::ALL {
        let json = serde_json::to_string(&state).unwrap();
        let back: PCState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}

#[test]
fn test_deleted_states_refuse_writes() {
    let ctx = TransitionContext { active: true, flushed: false };
    for state in PCState::ALL.into_iter().filter(|s| s.is_deleted()) {
        let err = state.transition(Transition::BeforeOptimisticWrite, ctx).unwrap_err();
        assert!(err.is_fatal(), "{state} accepted a write");
    }
}

#[test]
fn test_decided_ambiguities() {
    let ctx = TransitionContext { active: true, flushed: false };
    assert_eq!(
        PCState::Hollow.transition(Transition::Persist, ctx).unwrap(),
        PCState::New
    );
    assert_eq!(
        PCState::New.transition(Transition::CommitRetain, ctx).unwrap(),
        PCState::NonTransactional
    );
}

fn state() -> impl Strategy<Value = PCState> {
    (0..PCState::ALL.len()).prop_map(|i| PCState::ALL[i])
}

fn event() -> impl Strategy<Value = Transition> {
    (0..Transition::ALL.len()).prop_map(|i| Transition::ALL[i])
}

proptest! {
    #[test]
    fn test_event_sequences_stay_in_documented_states(
        start in state(),
        events in prop::collection::vec(event(), 0..32),
        active in any::<bool>(),
    ) {
        let ctx = TransitionContext { active, flushed: false };
        let mut current = start;
        for e in events {
            if let Ok(next) = current.transition(e, ctx) {
                current = next;
            }
            prop_assert!(PCState::ALL.contains(&current));
        }
    }
}
