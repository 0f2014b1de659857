//! OS-thread pool backend.
//!
//! Workers drain a shared queue and drive each job to completion with a
//! local executor. Jobs are the same boxed futures the task backend runs,
//! so callers are oblivious to the backend.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::{Job, WorkerPool};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Worker pool backed by a fixed set of OS threads.
pub struct ThreadPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    pending: Arc<AtomicUsize>,
    aborted: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let pending = Arc::new(AtomicUsize::new(0));
        let aborted = Arc::new(AtomicBool::new(false));
        // Jobs may await tokio timers; drive them on the constructing
        // runtime when one exists.
        let runtime = tokio::runtime::Handle::try_current().ok();

        debug!("Starting thread pool with {} workers", size);
        let mut handles = Vec::with_capacity(size);
        for worker in 0..size {
            let receiver = Arc::clone(&receiver);
            let pending = Arc::clone(&pending);
            let aborted = Arc::clone(&aborted);
            let runtime = runtime.clone();
            handles.push(std::thread::spawn(move || loop {
                // Holding the lock across recv serializes dequeueing only;
                // jobs run after the lock is released.
                let job = {
                    let rx = receiver.lock();
                    rx.recv()
                };
                match job {
                    Ok(job) => {
                        if !aborted.load(Ordering::SeqCst) {
                            match &runtime {
                                Some(handle) => handle.block_on(job),
                                None => futures::executor::block_on(job),
                            }
                        }
                        pending.fetch_sub(1, Ordering::SeqCst);
                    }
                    Err(_) => {
                        debug!("Thread pool worker {} exiting", worker);
                        break;
                    }
                }
            }));
        }

        Self {
            sender: Mutex::new(Some(sender)),
            pending,
            aborted,
            handles: Mutex::new(handles),
        }
    }
}

#[async_trait]
impl WorkerPool for ThreadPool {
    fn post(&self, job: Job) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) if tx.send(job).is_ok() => {}
            // Pool already shut down; the job is dropped unrun.
            _ => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    async fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        while self.pending.load(Ordering::SeqCst) > 0 {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return self.pending.load(Ordering::SeqCst) == 0;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
        true
    }

    fn abort(&self) {
        debug!("Thread pool abort requested");
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.wait_for_completion(None).await;
        // Dropping the sender ends the worker loops.
        self.sender.lock().take();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        debug!("Thread pool shut down");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Close the channel so detached workers exit even without an
        // explicit shutdown.
        self.sender.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runs_all_jobs() {
        let pool = ThreadPool::new(3);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.post(Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        assert!(pool.wait_for_completion(Some(Duration::from_secs(2))).await);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_times_out_on_slow_job() {
        let pool = ThreadPool::new(1);
        pool.post(Box::pin(async {
            std::thread::sleep(Duration::from_millis(100));
        }));

        assert!(
            !pool
                .wait_for_completion(Some(Duration::from_millis(10)))
                .await
        );
        assert!(pool.wait_for_completion(Some(Duration::from_secs(2))).await);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_abort_skips_queued_jobs() {
        let pool = ThreadPool::new(1);
        let ran = Arc::new(AtomicUsize::new(0));

        {
            let ran = Arc::clone(&ran);
            pool.post(Box::pin(async move {
                std::thread::sleep(Duration::from_millis(50));
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for _ in 0..4 {
            let ran = Arc::clone(&ran);
            pool.post(Box::pin(async move {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.abort();

        assert!(pool.wait_for_completion(Some(Duration::from_secs(2))).await);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_post_after_shutdown_is_dropped() {
        let pool = ThreadPool::new(1);
        pool.shutdown().await;

        pool.post(Box::pin(async {}));
        assert!(pool.wait_for_completion(Some(Duration::from_millis(50))).await);
    }
}
