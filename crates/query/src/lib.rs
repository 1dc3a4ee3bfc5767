//! Query-side value utilities for the stead runtime
//!
//! - [`filters`]: type promotion, conversion and arithmetic over field values
//! - [`ResultShape`]: nested result structure built from flat rows
//! - [`ResultPacker`]: projection rows to scalars, arrays, maps or user types
//! - [`QueryStatistics`]: per-query execution and cache-hit counters

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod filters;
pub mod result_packer;
pub mod result_shape;
pub mod statistics;

pub use filters::ArithmeticOp;
pub use result_packer::{PackTarget, ResultPacker, ResultTarget};
pub use result_shape::{ResultShape, ShapeKind};
pub use statistics::{QueryCounts, QueryStatistics};
