//! Background task pool
//!
//! Fire-and-forget work (failure reports, refunds, audit writes, archive
//! uploads) runs here, off the request path and independent of request
//! cancellation. A job that cannot be queued runs on a detached task
//! instead; jobs are never dropped.

use crate::config::TaskPoolConfig;
use parking_lot::Mutex;
use prometheus::IntCounter;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type BoxJob = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

struct Job {
    name: &'static str,
    future: BoxJob,
}

/// Bounded worker pool for side effects
#[derive(Clone)]
pub struct TaskPool {
    tx: async_channel::Sender<Job>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    overflow: IntCounter,
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("queued", &self.tx.len())
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

async fn run_job(job: Job) {
    let name = job.name;
    match tokio::spawn(job.future).await {
        Ok(Ok(())) => debug!(job = name, "background job done"),
        Ok(Err(e)) => error!(job = name, error = %e, "background job failed"),
        Err(e) => error!(job = name, error = %e, "background job panicked"),
    }
}

impl TaskPool {
    /// Start the workers (needs a running tokio runtime)
    pub fn new(config: &TaskPoolConfig, overflow: IntCounter) -> Self {
        let (tx, rx) = async_channel::bounded::<Job>(config.queue_capacity.max(1));
        let workers = (0..config.workers.max(1))
            .map(|_| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    while let Ok(job) = rx.recv().await {
                        run_job(job).await;
                    }
                })
            })
            .collect();

        Self {
            tx,
            workers: Arc::new(Mutex::new(workers)),
            overflow,
        }
    }

    /// Queue a named job
    pub fn submit<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let job = Job {
            name,
            future: Box::pin(future),
        };
        let job = match self.tx.try_send(job) {
            Ok(()) => return,
            Err(e) => e.into_inner(),
        };

        self.overflow.inc();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(job = name, "task pool unavailable, running job detached");
                handle.spawn(run_job(job));
            }
            Err(_) => error!(job = name, "no runtime for background job, job lost"),
        }
    }

    /// Jobs waiting for a worker
    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    /// Stop accepting jobs and wait for the queue to drain
    pub async fn shutdown(&self) {
        self.tx.close();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "task pool worker failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(workers: usize, queue_capacity: usize) -> TaskPool {
        let counter = IntCounter::new("test_overflow_total", "overflow").unwrap();
        TaskPool::new(
            &TaskPoolConfig {
                workers,
                queue_capacity,
            },
            counter,
        )
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let pool = pool(2, 64);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let done = done.clone();
            pool.submit("count", async move {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_failing_job_does_not_kill_worker() {
        let pool = pool(1, 8);
        let done = Arc::new(AtomicUsize::new(0));
        pool.submit("fails", async { Err(anyhow::anyhow!("boom")) });
        pool.submit("panics", async {
            let items: Vec<u32> = Vec::new();
            assert!(!items.is_empty(), "boom");
            Ok(())
        });
        let d = done.clone();
        pool.submit("after", async move {
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_runs_detached() {
        let pool = pool(1, 1);
        pool.shutdown().await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        pool.submit("late", async move {
            let _ = tx.send(());
            Ok(())
        });
        rx.await.unwrap();
        assert_eq!(pool.overflow.get(), 1);
    }
}
