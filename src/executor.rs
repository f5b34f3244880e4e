//! The async execution fabric: an owned worker pool every cross-service
//! fan-out goes through. Constructed once, handed to the builder and the
//! deletion coordinator, and drained explicitly on teardown.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::error;

pub struct TaskExecutor {
    tracker: TaskTracker,
    permits: Option<Arc<Semaphore>>,
}

impl TaskExecutor {
    /// A pool with an optional bound on concurrently running tasks.
    pub fn new(max_concurrent: Option<usize>) -> Self {
        Self {
            tracker: TaskTracker::new(),
            permits: max_concurrent.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    /// Run a task on the pool and hand back its join handle. Dropping the
    /// handle does not cancel the task; it keeps running to completion.
    pub fn submit<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = self.permits.clone();
        self.tracker.spawn(async move {
            let _permit = match permits {
                Some(permits) => permits.acquire_owned().await.ok(),
                None => None,
            };
            task.await
        })
    }

    /// Run a fallible task whose failure is logged here and never
    /// propagated; the returned handle always resolves with `()`.
    pub fn submit_tracked<F>(&self, label: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.submit(async move {
            if let Err(e) = task.await {
                error!(task = label, error = %e, "background task failed");
            }
        })
    }

    /// Tasks currently tracked by the pool (running or queued on a permit).
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting completion-tracking and wait for every submitted task
    /// to finish. In-flight cleanup always runs to completion.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_tasks() {
        let executor = TaskExecutor::new(None);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let counter = counter.clone();
            executor.submit(async move {
                sleep(Duration::from_millis(20)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        executor.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_tracked_task_failure_is_swallowed() {
        let executor = TaskExecutor::new(None);
        let handle = executor.submit_tracked("failing", async {
            anyhow::bail!("boom")
        });
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrency_bound_is_honored() {
        let executor = TaskExecutor::new(Some(1));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let running = running.clone();
            let peak = peak.clone();
            handles.push(executor.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
