//! Unit-of-work execution errors.

use thiserror::Error;

/// Error raised by an agent invocation.
///
/// Variants split into three groups: transient errors the reliability
/// pipeline may retry or fail over from, programming errors that always
/// propagate immediately, and a generic `Agent` variant whose retryability
/// is decided by message-pattern matching against the engine configuration.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("Rate limited: retry after {retry_after_seconds} seconds")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecutionError {
    /// Stable class name used in attempt records and serialized errors.
    pub fn class(&self) -> &'static str {
        match self {
            ExecutionError::RateLimited { .. } => "rate_limited",
            ExecutionError::Network(_) => "network",
            ExecutionError::Timeout(_) => "timeout",
            ExecutionError::Api { .. } => "api",
            ExecutionError::Agent(_) => "agent",
            ExecutionError::InvalidInput(_) => "invalid_input",
            ExecutionError::Internal(_) => "internal",
        }
    }

    /// Whether the error class is retryable regardless of message patterns.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutionError::RateLimited { .. } => true,
            ExecutionError::Network(_) => true,
            ExecutionError::Timeout(_) => true,
            ExecutionError::Api { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    /// Programming/validation errors are never retried or fallen back from.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            ExecutionError::InvalidInput(_) | ExecutionError::Internal(_)
        )
    }
}

/// Check if an HTTP status code is retryable.
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}
