//! # Weft Pool
//!
//! Fixed-size worker pools for parallel groups and iteration fan-out.
//!
//! Two interchangeable backends sit behind one trait: preemptible OS
//! threads (`ThreadPool`) and cooperative tokio tasks (`TaskPool`).
//! Orchestration logic never branches on which backend is active.

pub mod task;
pub mod thread;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use weft_protocols::PoolBackend;

pub use task::TaskPool;
pub use thread::ThreadPool;

/// A unit of pooled work.
pub type Job = BoxFuture<'static, ()>;

/// Bounded concurrent executor.
///
/// Concurrency is fixed at construction. `abort` is cooperative: jobs
/// already running must observe `is_aborted` at their next safe point;
/// queued-but-unstarted jobs are simply never run.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Enqueue a job. Never blocks the submitter.
    fn post(&self, job: Job);

    /// Block until every posted job has finished, or until `timeout`
    /// elapses. Returns `false` on timeout; already-running jobs are not
    /// interrupted.
    async fn wait_for_completion(&self, timeout: Option<Duration>) -> bool;

    /// Set the cooperative abort flag.
    fn abort(&self);

    /// Whether the pool has been aborted.
    fn is_aborted(&self) -> bool;

    /// Drain outstanding jobs and stop the workers.
    async fn shutdown(&self);
}

/// Build a pool for the configured backend.
pub fn build_pool(backend: PoolBackend, size: usize) -> Arc<dyn WorkerPool> {
    match backend {
        PoolBackend::Threads => Arc::new(ThreadPool::new(size)),
        PoolBackend::Tasks => Arc::new(TaskPool::new(size)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_pool_backends() {
        for backend in [PoolBackend::Threads, PoolBackend::Tasks] {
            let pool = build_pool(backend, 2);
            pool.post(Box::pin(async {}));
            assert!(pool.wait_for_completion(Some(Duration::from_secs(1))).await);
            pool.shutdown().await;
        }
    }
}
