//! # Weft Engine
//!
//! Workflow definitions and the orchestrator that drives them.
//!
//! ## Features
//!
//! - Declarative definitions: steps, parallel groups and wait points
//! - Conditional steps, value-based routing and item-wise iteration
//! - Nested sub-workflows with usage roll-up
//! - Wait points: delays, polled conditions, absolute times and human
//!   approvals with reminders and escalation
//! - Criticality-aware failure handling folded into one aggregate result

pub mod definition;
mod iteration;
pub mod orchestrator;
pub mod state;
mod step;
pub mod wait;

pub use definition::{
    Condition, ErrorHandler, IterationDef, ItemSource, ParallelGroupDef, RateLimitSpec,
    RouteSelector, RouterDef, StepCondition, StepDef, StepOptions, ThrottleSpec, TimeSource,
    WaitDef, WorkflowDefinition, WorkflowItem,
};
pub use orchestrator::Orchestrator;
pub use state::WorkflowContext;
pub use wait::{TimeoutAction, WaitKind};
