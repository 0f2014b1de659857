//! Cooperative tokio-task pool backend.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tracing::debug;

use crate::{Job, WorkerPool};

/// Worker pool backed by tokio tasks gated through a semaphore.
pub struct TaskPool {
    size: usize,
    semaphore: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    aborted: Arc<AtomicBool>,
    done: Arc<Notify>,
}

impl TaskPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        debug!("Starting task pool with {} permits", size);
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            pending: Arc::new(AtomicUsize::new(0)),
            aborted: Arc::new(AtomicBool::new(false)),
            done: Arc::new(Notify::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn finish_one(pending: &AtomicUsize, done: &Notify) {
        if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            done.notify_waiters();
        }
    }
}

#[async_trait]
impl WorkerPool for TaskPool {
    fn post(&self, job: Job) {
        self.pending.fetch_add(1, Ordering::SeqCst);

        let semaphore = Arc::clone(&self.semaphore);
        let pending = Arc::clone(&self.pending);
        let aborted = Arc::clone(&self.aborted);
        let done = Arc::clone(&self.done);

        tokio::spawn(async move {
            // A closed semaphore means the pool has shut down; the job is
            // dropped unrun.
            if let Ok(_permit) = semaphore.acquire().await {
                if !aborted.load(Ordering::SeqCst) {
                    job.await;
                }
            }
            Self::finish_one(&pending, &done);
        });
    }

    async fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.done.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return true;
            }
            match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return self.pending.load(Ordering::SeqCst) == 0;
                    }
                    if tokio::time::timeout(remaining, notified).await.is_err() {
                        return self.pending.load(Ordering::SeqCst) == 0;
                    }
                }
                None => notified.await,
            }
        }
    }

    fn abort(&self) {
        debug!("Task pool abort requested");
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.wait_for_completion(None).await;
        self.semaphore.close();
        debug!("Task pool shut down");
    }
}
