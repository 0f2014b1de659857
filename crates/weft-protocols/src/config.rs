//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Worker pool backend selection.
///
/// Orchestration logic never branches on the active backend; the two
/// implementations are interchangeable behind the pool trait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolBackend {
    /// OS-thread-backed workers.
    Threads,
    /// Cooperative tokio-task workers.
    #[default]
    Tasks,
}

/// Engine-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Case-insensitive substring patterns marking an error message as
    /// retryable in addition to the retryable error classes.
    #[serde(default = "default_retryable_patterns")]
    pub retryable_patterns: Vec<String>,

    /// Pool size for parallel groups with no explicit concurrency cap.
    #[serde(default = "default_pool_size")]
    pub default_pool_size: usize,

    /// Worker pool backend.
    #[serde(default)]
    pub pool_backend: PoolBackend,
}

fn default_retryable_patterns() -> Vec<String> {
    [
        "rate limit",
        "quota",
        "overloaded",
        "timeout",
        "timed out",
        "temporarily unavailable",
        "connection reset",
        "too many requests",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_pool_size() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retryable_patterns: default_retryable_patterns(),
            default_pool_size: default_pool_size(),
            pool_backend: PoolBackend::default(),
        }
    }
}

impl EngineConfig {
    /// Whether a message matches a retryable pattern (case-insensitive
    /// substring match).
    pub fn matches_retryable_pattern(&self, message: &str) -> bool {
        let message = message.to_lowercase();
        self.retryable_patterns
            .iter()
            .any(|p| message.contains(&p.to_lowercase()))
    }
}
