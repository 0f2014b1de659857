//! Workflow-level errors.
//!
//! These are the only errors that escape `Orchestrator::run`: configuration
//! problems a retry cannot fix, and the wall-clock total timeout.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("No route matched value '{value}' for step '{step}' and no default route is defined")]
    NoRouteMatched { step: String, value: String },

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Total timeout of {0:?} exceeded")]
    TotalTimeout(Duration),

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),
}
