//! Instance lifecycle for the stead persistence runtime
//!
//! This crate holds everything that happens to a single instance:
//! - [`PCState`]: the lifecycle phases and the pure transition table
//! - [`OpenStateManager`]: the contract every state manager flavor fulfills
//! - [`StateManagerImpl`]: the state manager of a managed instance
//! - [`DetachedStateManager`] / [`DetachedValueStateManager`]: detached copies
//! - [`ObjectIdStateManager`]: embedded identity values
//! - Field managers: [`TransferFieldManager`], [`SingleFieldManager`]
//!
//! Nothing here talks to a store or walks an object graph; the persistence
//! context in `stead-kernel` does that and calls in with the results.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod detached;
pub mod field_manager;
pub mod object_id;
pub mod pc_state;
pub mod state_manager;
pub mod state_manager_impl;

pub use detached::{
    DetachedOptions, DetachedSnapshot, DetachedStateManager, DetachedValueStateManager,
};
pub use field_manager::{FieldManager, SingleFieldManager, TransferFieldManager, TypedFieldManager};
pub use object_id::ObjectIdStateManager;
pub use pc_state::{FlushAction, PCState, StateEffect, Transition, TransitionContext};
pub use state_manager::{
    ContextFlags, ImplData, ObjectIdAssigner, OpenStateManager, RestoreState, SetKind,
};
pub use state_manager_impl::StateManagerImpl;
