//! Run-time workflow state.

use std::collections::HashMap;

use serde_json::{json, Value};

use weft_protocols::{ErrorInfo, StepResult, Usage, WorkflowStatus};

/// Accumulated context visible to conditions, selectors and targets.
#[derive(Clone, Default)]
pub struct WorkflowContext {
    /// The input the workflow was started with.
    pub input: Value,
    /// Results of items completed so far, keyed by name.
    pub results: HashMap<String, StepResult>,
}

impl WorkflowContext {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            results: HashMap::new(),
        }
    }

    /// Content of a completed item, if present.
    pub fn output_of(&self, name: &str) -> Option<Value> {
        self.results.get(name).map(|r| r.content())
    }

    /// The JSON object handed to a target: the workflow input plus the
    /// contents of every completed item.
    pub fn step_input(&self) -> Value {
        let steps: serde_json::Map<String, Value> = self
            .results
            .iter()
            .map(|(name, result)| (name.clone(), result.content()))
            .collect();
        json!({ "input": self.input, "steps": steps })
    }

    /// Per-item input for an iteration fan-out.
    pub fn item_input(&self, item: &Value, index: usize) -> Value {
        json!({ "item": item, "index": index, "input": self.input })
    }
}

/// What the orchestrator does after an item completes.
pub(crate) enum Control {
    Continue,
    /// Record the next item as skipped with the given reason.
    SkipNext(String),
    Halt,
}

/// Mutable bookkeeping for one run, separate from the context handed to
/// user closures.
pub(crate) struct RunState {
    pub errors: HashMap<String, ErrorInfo>,
    pub usage: Usage,
    pub status: WorkflowStatus,
    pub halted: bool,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            errors: HashMap::new(),
            usage: Usage::default(),
            status: WorkflowStatus::Success,
            halted: false,
        }
    }

    pub fn record_error(&mut self, name: &str, info: ErrorInfo, halting: bool) {
        self.errors.insert(name.to_string(), info);
        self.status.degrade_to(if halting {
            WorkflowStatus::Error
        } else {
            WorkflowStatus::Partial
        });
        if halting {
            self.halted = true;
        }
    }
}
