//! Step and workflow result types.
//!
//! `StepResult` is the sum type every executed item produces. Each branch
//! exposes `content()`, `is_success()` and `usage()` so callers can treat
//! any result polymorphically without matching on the shape.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ErrorInfo, Usage};

/// Result of executing a single workflow item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepResult {
    /// A produced value.
    Value {
        content: Value,
        success: bool,
        #[serde(default)]
        usage: Usage,
    },
    /// The item was skipped (unsatisfied condition, aborted fan-out, ...).
    Skipped { reason: String },
    /// The item failed.
    Failure { class: String, message: String },
    /// Results of an item-wise fan-out, order-stable by index.
    Iteration {
        items: Vec<StepResult>,
        #[serde(default)]
        errors: BTreeMap<usize, ErrorInfo>,
    },
    /// Aggregate of a nested workflow run.
    SubWorkflow { result: Box<WorkflowResult> },
}

impl StepResult {
    /// A successful value result.
    pub fn value(content: impl Into<Value>, usage: Usage) -> Self {
        StepResult::Value {
            content: content.into(),
            success: true,
            usage,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        StepResult::Skipped {
            reason: reason.into(),
        }
    }

    pub fn failure(class: impl Into<String>, message: impl Into<String>) -> Self {
        StepResult::Failure {
            class: class.into(),
            message: message.into(),
        }
    }

    /// Content of the result; `Null` for skipped and failed items.
    pub fn content(&self) -> Value {
        match self {
            StepResult::Value { content, .. } => content.clone(),
            StepResult::Skipped { .. } | StepResult::Failure { .. } => Value::Null,
            StepResult::Iteration { items, .. } => {
                Value::Array(items.iter().map(|r| r.content()).collect())
            }
            StepResult::SubWorkflow { result } => result.final_output.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            StepResult::Value { success, .. } => *success,
            StepResult::Skipped { .. } => false,
            StepResult::Failure { .. } => false,
            StepResult::Iteration { errors, .. } => errors.is_empty(),
            StepResult::SubWorkflow { result } => result.status == WorkflowStatus::Success,
        }
    }

    pub fn is_error(&self) -> bool {
        match self {
            StepResult::Failure { .. } => true,
            StepResult::Iteration { errors, .. } => !errors.is_empty(),
            StepResult::SubWorkflow { result } => result.status == WorkflowStatus::Error,
            _ => false,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, StepResult::Skipped { .. })
    }

    /// Token/cost metrics; zero where inapplicable.
    pub fn usage(&self) -> Usage {
        match self {
            StepResult::Value { usage, .. } => usage.clone(),
            StepResult::Skipped { .. } | StepResult::Failure { .. } => Usage::default(),
            StepResult::Iteration { items, .. } => {
                let mut total = Usage::default();
                for item in items {
                    total.add(&item.usage());
                }
                total
            }
            StepResult::SubWorkflow { result } => result.usage.clone(),
        }
    }

    /// Captured error detail, if the result carries one.
    pub fn error(&self) -> Option<ErrorInfo> {
        match self {
            StepResult::Failure { class, message } => Some(ErrorInfo::new(class, message)),
            StepResult::Iteration { errors, .. } => errors.values().next().cloned(),
            _ => None,
        }
    }
}

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Every step succeeded or was skipped.
    Success,
    /// At least one non-critical step failed.
    Partial,
    /// A critical step failed.
    Error,
}

impl WorkflowStatus {
    /// Move down the success → partial → error lattice, never up.
    pub fn degrade_to(&mut self, other: WorkflowStatus) {
        if (*self as u8) < (other as u8) {
            *self = other;
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Success => "success",
            WorkflowStatus::Partial => "partial",
            WorkflowStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate result of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// Workflow name.
    pub workflow: String,
    /// Overall status.
    pub status: WorkflowStatus,
    /// Per-step results, keyed by step/group/wait name.
    pub results: HashMap<String, StepResult>,
    /// Captured errors reduced to `{class, message}` pairs.
    #[serde(default)]
    pub errors: HashMap<String, ErrorInfo>,
    /// Summed token/cost metrics across all items.
    #[serde(default)]
    pub usage: Usage,
    /// Content of the last non-skipped, non-error result in definition order.
    pub final_output: Value,
    /// Wall-clock duration of the run in milliseconds.
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl WorkflowResult {
    pub fn get(&self, step: &str) -> Option<&StepResult> {
        self.results.get(step)
    }

    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Success
    }

    /// Serializable JSON form.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_result() -> WorkflowResult {
        let mut results = HashMap::new();
        results.insert(
            "fetch".to_string(),
            StepResult::value(json!({"items": 3}), Usage::new(10, 20)),
        );
        results.insert(
            "summarize".to_string(),
            StepResult::value("summary text", Usage::new(100, 50).with_cost(0.02)),
        );
        results.insert(
            "notify".to_string(),
            StepResult::skipped("condition not satisfied"),
        );

        let mut usage = Usage::default();
        for r in results.values() {
            usage.add(&r.usage());
        }

        let now = Utc::now();
        WorkflowResult {
            workflow: "report".to_string(),
            status: WorkflowStatus::Success,
            results,
            errors: HashMap::new(),
            usage,
            final_output: json!("summary text"),
            duration_ms: 1234,
            started_at: now,
            completed_at: now,
        }
    }

    #[test]
    fn test_value_result_accessors() {
        let result = StepResult::value("out", Usage::new(5, 5));
        assert!(result.is_success());
        assert!(!result.is_error());
        assert_eq!(result.content(), json!("out"));
        assert_eq!(result.usage().total_tokens, 10);
        assert!(result.error().is_none());
    }

    #[test]
    fn test_skipped_result_accessors() {
        let result = StepResult::skipped("unless matched");
        assert!(!result.is_success());
        assert!(!result.is_error());
        assert!(result.is_skipped());
        assert_eq!(result.content(), Value::Null);
        assert!(result.usage().is_zero());
    }

    #[test]
    fn test_failure_result_accessors() {
        let result = StepResult::failure("network", "connection refused");
        assert!(result.is_error());
        assert!(!result.is_success());
        let err = result.error().unwrap();
        assert_eq!(err.class, "network");
        assert!(result.usage().is_zero());
    }

    #[test]
    fn test_iteration_sums_usage_and_orders_content() {
        let items = vec![
            StepResult::value(json!(1), Usage::new(1, 1)),
            StepResult::value(json!(2), Usage::new(2, 2)),
            StepResult::value(json!(3), Usage::new(3, 3)),
        ];
        let result = StepResult::Iteration {
            items,
            errors: BTreeMap::new(),
        };
        assert!(result.is_success());
        assert_eq!(result.content(), json!([1, 2, 3]));
        assert_eq!(result.usage().total_tokens, 12);
    }

    #[test]
    fn test_iteration_with_errors_is_error() {
        let mut errors = BTreeMap::new();
        errors.insert(2, ErrorInfo::new("agent", "boom"));
        let result = StepResult::Iteration {
            items: vec![StepResult::value(json!(1), Usage::default())],
            errors,
        };
        assert!(result.is_error());
        assert!(!result.is_success());
        assert_eq!(result.error().unwrap().message, "boom");
    }

    #[test]
    fn test_status_degrade_lattice() {
        let mut status = WorkflowStatus::Success;
        status.degrade_to(WorkflowStatus::Partial);
        assert_eq!(status, WorkflowStatus::Partial);
        status.degrade_to(WorkflowStatus::Success);
        assert_eq!(status, WorkflowStatus::Partial);
        status.degrade_to(WorkflowStatus::Error);
        assert_eq!(status, WorkflowStatus::Error);
        status.degrade_to(WorkflowStatus::Partial);
        assert_eq!(status, WorkflowStatus::Error);
    }

    #[test]
    fn test_workflow_result_round_trip() {
        let result = sample_result();
        let json = serde_json::to_string(&result).unwrap();
        let back: WorkflowResult = serde_json::from_str(&json).unwrap();

        assert_eq!(back.status, result.status);
        assert_eq!(back.final_output, result.final_output);
        assert_eq!(back.usage, result.usage);
        assert_eq!(
            back.get("summarize").unwrap().content(),
            json!("summary text")
        );

        // Sums of child metrics equal the aggregate's reported totals.
        let mut summed = Usage::default();
        for r in back.results.values() {
            summed.add(&r.usage());
        }
        assert_eq!(summed, back.usage);
    }

    #[test]
    fn test_sub_workflow_result_wraps_aggregate() {
        let inner = sample_result();
        let usage = inner.usage.clone();
        let result = StepResult::SubWorkflow {
            result: Box::new(inner),
        };
        assert!(result.is_success());
        assert_eq!(result.content(), json!("summary text"));
        assert_eq!(result.usage(), usage);
    }

    #[test]
    fn test_iteration_error_map_round_trip() {
        let mut errors = BTreeMap::new();
        errors.insert(2, ErrorInfo::new("timeout", "deadline exceeded"));
        let result = StepResult::Iteration {
            items: vec![
                StepResult::value(json!("a"), Usage::default()),
                StepResult::value(json!("b"), Usage::default()),
                StepResult::failure("timeout", "deadline exceeded"),
            ],
            errors,
        };
        let json = serde_json::to_string(&result).unwrap();
        let back: StepResult = serde_json::from_str(&json).unwrap();
        match back {
            StepResult::Iteration { items, errors } => {
                assert_eq!(items.len(), 3);
                assert_eq!(errors.get(&2).unwrap().class, "timeout");
            }
            other => panic!("unexpected result shape: {:?}", other),
        }
    }
}
