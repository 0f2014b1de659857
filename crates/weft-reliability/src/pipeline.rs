//! The per-unit-of-work reliability pipeline.
//!
//! Composes retry, circuit breaking and fallback around a single logical
//! invocation, enforcing a wall-clock total timeout across all attempts
//! and recording per-attempt telemetry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use weft_protocols::{Agent, EngineConfig, ErrorInfo, ExecutionError, StepOutput};

use crate::backoff::RetryPolicy;
use crate::breaker::{BreakerRegistry, CircuitBreaker};
use crate::fallback::FallbackChain;

/// Telemetry for one attempt against one target. Append-only; surfaced
/// verbatim on the aggregate exhaustion error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    /// Skipped without invoking the target because its breaker was open.
    pub short_circuited: bool,
}

impl AttemptRecord {
    fn success(target: &str, started_at: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            target: target.to_string(),
            started_at,
            completed_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            error_class: None,
            error_message: None,
            short_circuited: false,
        }
    }

    fn failure(
        target: &str,
        started_at: DateTime<Utc>,
        duration: Duration,
        class: &str,
        message: String,
    ) -> Self {
        Self {
            target: target.to_string(),
            started_at,
            completed_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            error_class: Some(class.to_string()),
            error_message: Some(message),
            short_circuited: false,
        }
    }

    fn short_circuit(target: &str) -> Self {
        let now = Utc::now();
        Self {
            target: target.to_string(),
            started_at: now,
            completed_at: now,
            duration_ms: 0,
            error_class: Some("circuit_open".to_string()),
            error_message: Some("circuit breaker open".to_string()),
            short_circuited: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_class.is_none() && !self.short_circuited
    }
}

/// Terminal pipeline failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Every target failed or was short-circuited. Carries the full
    /// ordered attempt list and the error from the last target tried.
    #[error("All targets exhausted; last error: {last_error}")]
    AllTargetsFailed {
        attempts: Vec<AttemptRecord>,
        last_error: ExecutionError,
    },

    /// Wall clock exceeded across the whole multi-target sequence.
    #[error("Total timeout of {timeout:?} exceeded")]
    TotalTimeout {
        timeout: Duration,
        attempts: Vec<AttemptRecord>,
    },

    /// Non-retryable error; propagated on first occurrence.
    #[error("Non-retryable error: {0}")]
    NonRetryable(ExecutionError),

    #[error("No targets to execute")]
    NoTargets,
}

impl PipelineError {
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            PipelineError::AllTargetsFailed { attempts, .. } => attempts,
            PipelineError::TotalTimeout { attempts, .. } => attempts,
            _ => &[],
        }
    }

    /// Reduce to a serializable `{class, message}` pair.
    ///
    /// Exhaustion keeps the last target's error class so downstream
    /// handlers can still discriminate the failure kind.
    pub fn error_info(&self) -> ErrorInfo {
        match self {
            PipelineError::AllTargetsFailed { last_error, .. } => {
                ErrorInfo::new(last_error.class(), self.to_string())
            }
            PipelineError::TotalTimeout { .. } => ErrorInfo::new("total_timeout", self.to_string()),
            PipelineError::NonRetryable(err) => ErrorInfo::new(err.class(), err.to_string()),
            PipelineError::NoTargets => ErrorInfo::new("no_targets", self.to_string()),
        }
    }
}

enum AttemptOutcome {
    Ok(StepOutput),
    Failed(ExecutionError),
    DeadlineExceeded,
}

/// Executes one unit of work against an ordered target chain.
#[derive(Clone)]
pub struct ReliabilityPipeline {
    breakers: Arc<BreakerRegistry>,
    config: EngineConfig,
}

impl ReliabilityPipeline {
    pub fn new(breakers: Arc<BreakerRegistry>, config: EngineConfig) -> Self {
        Self { breakers, config }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Execute against `targets` in order.
    ///
    /// With a single target, the retry policy applies in place. With
    /// fallbacks, in-place retries are skipped entirely: a retryable
    /// failure advances straight to the next target, trading latency for
    /// diversity. Non-retryable errors propagate on first occurrence
    /// after updating the breaker.
    pub async fn execute(
        &self,
        scope: &str,
        targets: &[Arc<dyn Agent>],
        input: &Value,
        policy: &RetryPolicy,
        total_timeout: Option<Duration>,
    ) -> Result<(StepOutput, Vec<AttemptRecord>), PipelineError> {
        let started = Instant::now();
        let deadline = total_timeout.map(|t| started + t);

        let mut chain = FallbackChain::with_key(targets.to_vec(), |a| a.id().to_string());
        if chain.is_empty() {
            return Err(PipelineError::NoTargets);
        }
        let has_fallbacks = chain.has_fallbacks();
        let strategy = policy.strategy();

        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut last_error: Option<ExecutionError> = None;

        while let Some(agent) = chain.current() {
            let agent = Arc::clone(agent);

            if deadline_passed(deadline) {
                return Err(self.total_timeout(total_timeout, attempts));
            }

            let breaker = self
                .breakers
                .breaker(&format!("{}:{}", scope, agent.id()));
            if breaker.is_open() {
                debug!(
                    "Skipping target '{}' for '{}': circuit breaker open",
                    agent.id(),
                    scope
                );
                attempts.push(AttemptRecord::short_circuit(agent.id()));
                chain.advance();
                continue;
            }

            let mut retry_count = 0u32;
            loop {
                match self
                    .attempt(&agent, input, deadline, &breaker, &mut attempts)
                    .await
                {
                    AttemptOutcome::Ok(output) => {
                        debug!(
                            "Target '{}' succeeded for '{}' after {} attempt(s)",
                            agent.id(),
                            scope,
                            attempts.len()
                        );
                        return Ok((output, attempts));
                    }
                    AttemptOutcome::DeadlineExceeded => {
                        return Err(self.total_timeout(total_timeout, attempts));
                    }
                    AttemptOutcome::Failed(err) => {
                        if !self.is_retryable(&err, policy) {
                            debug!(
                                "Non-retryable {} error from '{}': {}",
                                err.class(),
                                agent.id(),
                                err
                            );
                            return Err(PipelineError::NonRetryable(err));
                        }

                        // With fallbacks configured, a quota error on one
                        // model is unlikely to self-resolve before the next
                        // model succeeds; advance instead of retrying.
                        if has_fallbacks || !strategy.should_retry(retry_count) {
                            last_error = Some(err);
                            break;
                        }

                        let delay = strategy.delay_for(retry_count);
                        warn!(
                            "Attempt {}/{} on '{}' failed: {}, retrying in {:?}",
                            retry_count + 1,
                            strategy.max_attempts + 1,
                            agent.id(),
                            err,
                            delay
                        );
                        if let Some(d) = deadline {
                            if Instant::now() + delay >= d {
                                return Err(self.total_timeout(total_timeout, attempts));
                            }
                        }
                        sleep(delay).await;
                        retry_count += 1;
                    }
                }
            }

            chain.advance();
        }

        let last_error = last_error.unwrap_or_else(|| {
            ExecutionError::Internal("all targets short-circuited by open circuit breakers".into())
        });
        warn!(
            "All {} target(s) exhausted for '{}': {}",
            attempts.len(),
            scope,
            last_error
        );
        Err(PipelineError::AllTargetsFailed {
            attempts,
            last_error,
        })
    }

    async fn attempt(
        &self,
        agent: &Arc<dyn Agent>,
        input: &Value,
        deadline: Option<Instant>,
        breaker: &Arc<CircuitBreaker>,
        attempts: &mut Vec<AttemptRecord>,
    ) -> AttemptOutcome {
        let started_at = Utc::now();
        let t0 = Instant::now();

        let result = match deadline {
            Some(d) => {
                let remaining = d.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, agent.invoke(input.clone())).await {
                    Ok(result) => result,
                    Err(_) => {
                        breaker.record_failure();
                        attempts.push(AttemptRecord::failure(
                            agent.id(),
                            started_at,
                            t0.elapsed(),
                            "total_timeout",
                            "wall-clock deadline exceeded mid-attempt".to_string(),
                        ));
                        return AttemptOutcome::DeadlineExceeded;
                    }
                }
            }
            None => agent.invoke(input.clone()).await,
        };

        match result {
            Ok(output) => {
                breaker.record_success();
                attempts.push(AttemptRecord::success(agent.id(), started_at, t0.elapsed()));
                AttemptOutcome::Ok(output)
            }
            Err(err) => {
                breaker.record_failure();
                attempts.push(AttemptRecord::failure(
                    agent.id(),
                    started_at,
                    t0.elapsed(),
                    err.class(),
                    err.to_string(),
                ));
                AttemptOutcome::Failed(err)
            }
        }
    }

    fn is_retryable(&self, err: &ExecutionError, policy: &RetryPolicy) -> bool {
        if err.is_programming_error() {
            return false;
        }
        if err.is_retryable() {
            return true;
        }
        let message = err.to_string().to_lowercase();
        self.config.matches_retryable_pattern(&message)
            || policy
                .retry_on
                .iter()
                .any(|p| message.contains(&p.to_lowercase()))
    }

    fn total_timeout(
        &self,
        total_timeout: Option<Duration>,
        attempts: Vec<AttemptRecord>,
    ) -> PipelineError {
        PipelineError::TotalTimeout {
            timeout: total_timeout.unwrap_or_default(),
            attempts,
        }
    }
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}
