//! Error types for the Weft protocol layer.

mod execution;
mod workflow;

pub use execution::*;
pub use workflow::*;
