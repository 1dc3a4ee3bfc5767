//! Lifecycle Test Suite
//!
//! Properties of the `PCState` machine and of the field bitsets state
//! managers maintain.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test lifecycle
//!
//! # State machine only
//! cargo test --test lifecycle state_machine::
//! ```

#[path = "../common/mod.rs"]
mod common;

mod field_sets;
mod state_machine;
