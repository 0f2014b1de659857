//! Common value types shared across the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExecutionError;

/// Token and cost metrics for a unit of work.
///
/// Every result branch exposes a `Usage`, zero-valued when inapplicable, so
/// callers can sum metrics without inspecting the result shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub cost: f64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            cost: 0.0,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Add another usage into this one, saturating on overflow.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
        self.cost += other.cost;
    }

    pub fn is_zero(&self) -> bool {
        self.total_tokens == 0 && self.input_tokens == 0 && self.output_tokens == 0 && self.cost == 0.0
    }
}

/// Output of a successful agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    /// Produced content.
    pub content: Value,
    /// Token/cost metrics for the invocation.
    #[serde(default)]
    pub usage: Usage,
}

impl StepOutput {
    pub fn new(content: impl Into<Value>) -> Self {
        Self {
            content: content.into(),
            usage: Usage::default(),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

/// Serializable `{class, message}` pair for a captured error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub class: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }
}

impl From<&ExecutionError> for ErrorInfo {
    fn from(err: &ExecutionError) -> Self {
        Self::new(err.class(), err.to_string())
    }
}
