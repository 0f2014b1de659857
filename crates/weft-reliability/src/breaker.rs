//! Per-target circuit breakers.
//!
//! State is process-wide and keyed by `"{agent}:{target}"`; the registry is
//! injectable rather than ambient so tests can reset it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests flow; failures are counted.
    Closed,
    /// Requests are short-circuited.
    Open,
    /// One trial request is allowed.
    HalfOpen,
}

/// Breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within the window that open the breaker.
    #[serde(default = "default_errors")]
    pub errors: u32,

    /// Sliding window over which failures are counted.
    #[serde(default = "default_within")]
    pub within: Duration,

    /// Time the breaker stays open before allowing a trial.
    #[serde(default = "default_cooldown")]
    pub cooldown: Duration,
}

fn default_errors() -> u32 {
    5
}

fn default_within() -> Duration {
    Duration::from_secs(60)
}

fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            errors: default_errors(),
            within: default_within(),
            cooldown: default_cooldown(),
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    /// Whether the half-open trial slot has been handed out.
    trial_taken: bool,
}

/// Failure-count/cooldown state machine for one target.
///
/// `record_success`/`record_failure` are the only mutators; `is_open` is
/// the only query the reliability pipeline needs before an attempt. The
/// open → half-open transition happens lazily on `is_open`, not via a
/// timer.
pub struct CircuitBreaker {
    key: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_taken: false,
            }),
        }
    }

    /// Whether an attempt should be short-circuited.
    ///
    /// In the half-open state the first caller gets the trial slot and a
    /// `false`; subsequent callers see `true` until the trial resolves.
    pub fn is_open(&self) -> bool {
        let mut inner = self.inner.lock();
        self.advance_cooldown(&mut inner);

        match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => true,
            BreakerState::HalfOpen => {
                if inner.trial_taken {
                    true
                } else {
                    inner.trial_taken = true;
                    debug!("Breaker '{}' half-open: allowing trial attempt", self.key);
                    false
                }
            }
        }
    }

    /// Current state, after applying any due cooldown transition.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.advance_cooldown(&mut inner);
        inner.state
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            debug!("Breaker '{}' closing after successful attempt", self.key);
        }
        inner.state = BreakerState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.trial_taken = false;
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.advance_cooldown(&mut inner);

        match inner.state {
            BreakerState::HalfOpen => {
                warn!("Breaker '{}' re-opening: trial attempt failed", self.key);
                self.open(&mut inner, now);
            }
            BreakerState::Closed => {
                inner.failures.push_back(now);
                while let Some(front) = inner.failures.front() {
                    if now.duration_since(*front) > self.config.within {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() as u32 >= self.config.errors {
                    warn!(
                        "Breaker '{}' opening: {} failures within {:?}",
                        self.key,
                        inner.failures.len(),
                        self.config.within
                    );
                    self.open(&mut inner, now);
                }
            }
            BreakerState::Open => {
                // Already open; cooldown keeps running from the first open.
            }
        }
    }

    fn open(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
        inner.trial_taken = false;
        inner.failures.clear();
    }

    fn advance_cooldown(&self, inner: &mut BreakerInner) {
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_taken = false;
                }
            }
        }
    }
}

/// Process-wide breaker registry keyed by `"{agent}:{target}"`.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Get or create the breaker for a key.
    pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone())))
            .clone()
    }

    pub fn reset(&self, key: &str) {
        self.breakers.remove(key);
    }

    pub fn reset_all(&self) {
        self.breakers.clear();
    }
}
