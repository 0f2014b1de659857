//! # Weft Protocols
//!
//! Shared contracts for the Weft workflow engine.
//!
//! ## Contents
//!
//! - Error taxonomy (`error`)
//! - Step/workflow result types (`result`)
//! - Usage metrics and common types (`types`)
//! - The unit-of-work `Agent` trait and registry (`agent`)
//! - Approval store and notifier collaborator traits (`approval`)
//! - Engine configuration (`config`)

pub mod agent;
pub mod approval;
pub mod config;
pub mod error;
pub mod result;
pub mod types;

pub use agent::{Agent, AgentRegistry};
pub use approval::{
    ApprovalRecord, ApprovalStatus, ApprovalStore, MemoryApprovalStore, Notifier,
};
pub use config::{EngineConfig, PoolBackend};
pub use error::{ExecutionError, WorkflowError};
pub use result::{StepResult, WorkflowResult, WorkflowStatus};
pub use types::{ErrorInfo, StepOutput, Usage};
