//! Detach/attach integration tests
//!
//! Round trips through the broker API, optimistic version conflicts,
//! callback failure modes, inverse management, the detached wire form and
//! factory/registry lifetimes.

#[path = "../common/mod.rs"]
mod common;

mod callbacks;
mod factories;
mod inverse;
mod round_trip;
mod versioning;
mod wire;
