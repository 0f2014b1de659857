//! Backoff strategies and retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Shape of the delay curve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Always the base delay.
    Constant,
    /// `base * attempt`.
    Linear,
    /// `base * 2^attempt`, capped at the maximum delay.
    #[default]
    Exponential,
}

/// Pure attempt-number → delay function.
///
/// Stateless and synchronous; callers are responsible for sleeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffStrategy {
    pub kind: BackoffKind,
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Add jitter of up to 50% of the computed delay.
    pub jitter: bool,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
            jitter: true,
        }
    }
}

impl BackoffStrategy {
    /// Delay before the retry following `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as f64;
        let computed = match self.kind {
            BackoffKind::Constant => base_ms,
            BackoffKind::Linear => base_ms * attempt as f64,
            BackoffKind::Exponential => {
                let factor = 2f64.powi(attempt.min(63) as i32);
                (base_ms * factor).min(self.max_delay.as_millis() as f64)
            }
        };

        let delay_ms = if self.jitter {
            computed + jitter_fraction() * 0.5 * computed
        } else {
            computed
        };

        Duration::from_millis(delay_ms as u64)
    }

    /// Whether another retry is allowed after `attempt` retries.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Uniform-ish value in `[0, 1)` derived from system-time nanos.
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    nanos as f64 / (u32::MAX as f64 + 1.0)
}

/// Retry policy attached to a step or pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff curve between retries.
    #[serde(default)]
    pub backoff: BackoffKind,

    /// Base delay.
    #[serde(default = "default_base_delay")]
    pub base_delay: Duration,

    /// Cap for exponential delays.
    #[serde(default = "default_max_delay")]
    pub max_delay: Duration,

    /// Extra case-insensitive substring patterns treated as retryable for
    /// this step only.
    #[serde(default)]
    pub retry_on: Vec<String>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffKind::default(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            retry_on: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, kind: BackoffKind, base_delay: Duration) -> Self {
        self.backoff = kind;
        self.base_delay = base_delay;
        self
    }

    pub fn with_retry_on(mut self, patterns: Vec<String>) -> Self {
        self.retry_on = patterns;
        self
    }

    /// Backoff strategy for this policy.
    pub fn strategy(&self) -> BackoffStrategy {
        BackoffStrategy {
            kind: self.backoff,
            base: self.base_delay,
            max_delay: self.max_delay,
            max_attempts: self.max_retries,
            jitter: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(kind: BackoffKind, jitter: bool) -> BackoffStrategy {
        BackoffStrategy {
            kind,
            base: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            max_attempts: 3,
            jitter,
        }
    }

    #[test]
    fn test_constant_delay() {
        let s = strategy(BackoffKind::Constant, false);
        assert_eq!(s.delay_for(0), Duration::from_millis(100));
        assert_eq!(s.delay_for(5), Duration::from_millis(100));
    }

    #[test]
    fn test_linear_delay() {
        let s = strategy(BackoffKind::Linear, false);
        assert_eq!(s.delay_for(0), Duration::ZERO);
        assert_eq!(s.delay_for(1), Duration::from_millis(100));
        assert_eq!(s.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_delay_with_cap() {
        let s = strategy(BackoffKind::Exponential, false);
        assert_eq!(s.delay_for(0), Duration::from_millis(100));
        assert_eq!(s.delay_for(1), Duration::from_millis(200));
        assert_eq!(s.delay_for(2), Duration::from_millis(400));
        // 100 * 2^4 = 1600, capped at 800
        assert_eq!(s.delay_for(4), Duration::from_millis(800));
        // Large attempt numbers must not overflow
        assert_eq!(s.delay_for(200), Duration::from_millis(800));
    }

    #[test]
    fn test_exponential_jitter_envelope() {
        let s = strategy(BackoffKind::Exponential, true);
        for attempt in 0..8 {
            let expected = (100u64 * 2u64.pow(attempt.min(4))).min(800);
            let delay = s.delay_for(attempt).as_millis() as u64;
            assert!(
                delay >= expected && delay <= expected + expected / 2,
                "attempt {}: delay {} outside [{}, {}]",
                attempt,
                delay,
                expected,
                expected + expected / 2
            );
        }
    }

    #[test]
    fn test_should_retry() {
        let s = strategy(BackoffKind::Constant, false);
        assert!(s.should_retry(0));
        assert!(s.should_retry(2));
        assert!(!s.should_retry(3));
        assert!(!s.should_retry(10));
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff, BackoffKind::Exponential);
        assert!(policy.retry_on.is_empty());
    }

    #[test]
    fn test_retry_policy_none() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_retries, 0);
        assert!(!policy.strategy().should_retry(0));
    }

    #[test]
    fn test_retry_policy_builders() {
        let policy = RetryPolicy::default()
            .with_max_retries(5)
            .with_backoff(BackoffKind::Linear, Duration::from_millis(50))
            .with_retry_on(vec!["model busy".to_string()]);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.backoff, BackoffKind::Linear);
        assert_eq!(policy.strategy().base, Duration::from_millis(50));
        assert_eq!(policy.retry_on.len(), 1);
    }
}
