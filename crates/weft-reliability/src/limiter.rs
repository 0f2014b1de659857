//! Throttle and token-bucket rate limiting.
//!
//! Both primitives are process-wide keyed registries, safe under concurrent
//! access from workers sharing the same key. State entries are never held
//! across an await point; callers compute the wait under the entry lock,
//! drop it, then sleep.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::time::sleep;
use tracing::debug;

/// Minimum-interval pacing between calls sharing a key.
#[derive(Default)]
pub struct Throttle {
    /// Key → earliest instant the next call may proceed.
    next_allowed: DashMap<String, Instant>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guarantee at least `min_interval` between successive calls for
    /// `key`, blocking the caller for the remaining time if invoked too
    /// soon. The first call never waits. Returns the waited duration.
    pub async fn throttle(&self, key: &str, min_interval: Duration) -> Duration {
        let wait = {
            let now = Instant::now();
            let mut slot = self.next_allowed.entry(key.to_string()).or_insert(now);
            let wait = slot.saturating_duration_since(now);
            *slot = now.max(*slot) + min_interval;
            wait
        };

        if !wait.is_zero() {
            debug!("Throttling '{}' for {:?}", key, wait);
            sleep(wait).await;
        }
        wait
    }

    pub fn reset(&self, key: &str) {
        self.next_allowed.remove(key);
    }

    pub fn reset_all(&self) {
        self.next_allowed.clear();
    }
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(calls: u32, per: Duration) -> Self {
        let capacity = calls.max(1) as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: capacity / per.as_secs_f64().max(f64::EPSILON),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

/// Classic token bucket keyed by string.
#[derive(Default)]
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until at least one token is available for `key`, consuming
    /// one. The bucket has capacity `calls` and refills at `calls / per`
    /// tokens per second. Returns the waited duration.
    pub async fn acquire(&self, key: &str, calls: u32, per: Duration) -> Duration {
        let started = Instant::now();
        loop {
            let wait = {
                let mut bucket = self
                    .buckets
                    .entry(key.to_string())
                    .or_insert_with(|| Bucket::new(calls, per));
                bucket.refill(Instant::now());
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return started.elapsed();
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.refill_per_sec)
            };

            debug!("Rate limit on '{}': waiting {:?} for a token", key, wait);
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Non-destructive peek: whether a token is currently available.
    pub fn available(&self, key: &str) -> bool {
        match self.buckets.get_mut(key) {
            Some(mut bucket) => {
                bucket.refill(Instant::now());
                bucket.tokens >= 1.0
            }
            // No bucket yet means the first acquire will not wait.
            None => true,
        }
    }

    pub fn reset(&self, key: &str) {
        self.buckets.remove(key);
    }

    pub fn reset_all(&self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_throttle_first_call_never_waits() {
        let throttle = Throttle::new();
        let waited = throttle.throttle("k", Duration::from_millis(50)).await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_throttle_enforces_min_interval() {
        let throttle = Throttle::new();
        let interval = Duration::from_millis(30);

        let start = Instant::now();
        throttle.throttle("k", interval).await;
        let waited = throttle.throttle("k", interval).await;

        assert!(waited > Duration::ZERO);
        assert!(start.elapsed() >= interval);
    }

    #[tokio::test]
    async fn test_throttle_keys_are_independent() {
        let throttle = Throttle::new();
        throttle.throttle("a", Duration::from_millis(100)).await;
        let waited = throttle.throttle("b", Duration::from_millis(100)).await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_throttle_reset() {
        let throttle = Throttle::new();
        throttle.throttle("k", Duration::from_millis(200)).await;
        throttle.reset("k");
        let waited = throttle.throttle("k", Duration::from_millis(200)).await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_bucket_exhaustion_and_refill() {
        let limiter = RateLimiter::new();
        let per = Duration::from_millis(200);

        // Drain a bucket of capacity 4.
        for _ in 0..4 {
            let waited = limiter.acquire("k", 4, per).await;
            assert!(waited < Duration::from_millis(20));
        }
        assert!(!limiter.available("k"));

        // After per/N, exactly one token has refilled.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.available("k"));
        limiter.acquire("k", 4, per).await;
        assert!(!limiter.available("k"));
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_token() {
        let limiter = RateLimiter::new();
        let per = Duration::from_millis(100);

        limiter.acquire("k", 1, per).await;
        let waited = limiter.acquire("k", 1, per).await;
        assert!(waited >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_reset_refills_bucket() {
        let limiter = RateLimiter::new();
        limiter.acquire("k", 1, Duration::from_secs(60)).await;
        assert!(!limiter.available("k"));

        limiter.reset("k");
        assert!(limiter.available("k"));

        limiter.acquire("k", 1, Duration::from_secs(60)).await;
        limiter.reset_all();
        assert!(limiter.available("k"));
    }

    #[tokio::test]
    async fn test_concurrent_acquires_share_bucket() {
        let limiter = Arc::new(RateLimiter::new());
        let per = Duration::from_millis(100);

        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire("shared", 2, per).await
            }));
        }

        let mut waits = Vec::new();
        for handle in handles {
            waits.push(handle.await.unwrap());
        }

        // Two acquire immediately; the third waits for a refill.
        waits.sort();
        assert!(waits[0] < Duration::from_millis(20));
        assert!(waits[2] >= Duration::from_millis(20));
    }
}
