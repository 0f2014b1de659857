//! # Weft Reliability
//!
//! Per-unit-of-work reliability for the Weft workflow engine.
//!
//! ## Features
//!
//! - Backoff strategies (constant, linear, exponential with jitter)
//! - Throttle and token-bucket rate limiting keyed by string
//! - Per-target circuit breakers with sliding failure windows
//! - Ordered fallback chains
//! - The reliability pipeline composing all of the above with a
//!   wall-clock total timeout and per-attempt telemetry

pub mod backoff;
pub mod breaker;
pub mod fallback;
pub mod limiter;
pub mod pipeline;

pub use backoff::{BackoffKind, BackoffStrategy, RetryPolicy};
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use fallback::FallbackChain;
pub use limiter::{RateLimiter, Throttle};
pub use pipeline::{AttemptRecord, PipelineError, ReliabilityPipeline};
