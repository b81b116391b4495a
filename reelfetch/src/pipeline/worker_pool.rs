//! Worker pool implementation for download jobs.
//!
//! A fixed number of workers pull from one bounded FIFO queue. Submitting
//! waits while the queue is full, which throttles producers to the speed of
//! the downloads themselves.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobContext, QueuedJob};
use crate::{Error, Result};

/// Configuration for a worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of workers, and so the maximum number of concurrent jobs.
    pub max_workers: usize,
    /// Jobs that may wait in the queue before `submit` blocks.
    pub queue_capacity: usize,
    /// Time cancelled jobs get to clean up before they are aborted.
    pub cancel_grace_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_capacity: 16,
            cancel_grace_ms: 15_000,
        }
    }
}

impl WorkerPoolConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub panicked: u64,
    pub active: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    panicked: AtomicU64,
    active: AtomicUsize,
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedJob>>>;

/// A pool of workers executing [`Job`]s.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    /// `None` once the pool stopped accepting jobs.
    sender: parking_lot::Mutex<Option<mpsc::Sender<QueuedJob>>>,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
    cancellation_token: CancellationToken,
    counters: Arc<Counters>,
    sequence: AtomicU64,
}

impl WorkerPool {
    /// Start a pool whose token is a child of `parent`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: WorkerPoolConfig, parent: &CancellationToken) -> Self {
        let config = WorkerPoolConfig {
            max_workers: config.max_workers.max(1),
            queue_capacity: config.queue_capacity.max(1),
            cancel_grace_ms: config.cancel_grace_ms,
        };
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));
        let cancellation_token = parent.child_token();
        let counters = Arc::new(Counters::default());

        info!(
            workers = config.max_workers,
            queue = config.queue_capacity,
            "starting worker pool"
        );

        let mut join_set = JoinSet::new();
        for worker_id in 0..config.max_workers {
            join_set.spawn(worker_loop(
                worker_id,
                receiver.clone(),
                cancellation_token.clone(),
                counters.clone(),
            ));
        }

        Self {
            config,
            sender: parking_lot::Mutex::new(Some(tx)),
            tasks: parking_lot::Mutex::new(Some(join_set)),
            cancellation_token,
            counters,
            sequence: AtomicU64::new(0),
        }
    }

    /// Queue a job, waiting while the queue is full.
    ///
    /// Fails with [`Error::PoolClosed`] once [`stop`](Self::stop) was called
    /// and with [`Error::Cancelled`] when the pool token fires while waiting.
    pub async fn submit(&self, job: Job) -> Result<()> {
        let sender = self.sender.lock().clone().ok_or(Error::PoolClosed)?;
        if self.cancellation_token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let name = job.name().to_string();
        let queued = QueuedJob { sequence, job };

        tokio::select! {
            biased;
            _ = self.cancellation_token.cancelled() => Err(Error::Cancelled),
            sent = sender.send(queued) => {
                sent.map_err(|_| Error::PoolClosed)?;
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                debug!(job = %name, sequence, "job queued");
                Ok(())
            }
        }
    }

    /// Stop accepting jobs and wait for queued and running jobs to finish.
    ///
    /// If `deadline` passes first, the pool token is cancelled and running
    /// jobs get [`cancel_grace`](WorkerPoolConfig::cancel_grace) to roll back
    /// before the workers are aborted; [`Error::Timeout`] is returned either
    /// way. Calling it again is a no-op.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        self.shutdown(tokio::time::sleep(deadline), deadline).await
    }

    /// Like [`stop`](Self::stop), but waits for the queue to drain for as
    /// long as `interrupt` is not cancelled. Once it fires, jobs have
    /// `deadline` to finish before the pool token is cancelled.
    pub async fn stop_on(&self, interrupt: &CancellationToken, deadline: Duration) -> Result<()> {
        let patience = async {
            interrupt.cancelled().await;
            info!(deadline = ?deadline, "interrupted, waiting for running jobs");
            tokio::time::sleep(deadline).await;
        };
        self.shutdown(patience, deadline).await
    }

    async fn shutdown(&self, patience: impl Future<Output = ()>, deadline: Duration) -> Result<()> {
        let sender = self.sender.lock().take();
        let join_set = self.tasks.lock().take();
        let Some(mut join_set) = join_set else {
            return Ok(());
        };
        // Dropping the last sender lets idle workers see the end of the queue.
        drop(sender);
        info!("stopping worker pool");

        let drained = tokio::select! {
            _ = join_workers(&mut join_set) => true,
            _ = patience => false,
        };
        if drained {
            info!(stats = ?self.stats(), "worker pool stopped");
            return Ok(());
        }

        let grace = self.config.cancel_grace();
        warn!(
            active = self.active_count(),
            grace = ?grace,
            "worker pool drain deadline exceeded, cancelling jobs"
        );
        self.cancellation_token.cancel();
        if tokio::time::timeout(grace, join_workers(&mut join_set))
            .await
            .is_err()
        {
            error!(
                active = self.active_count(),
                "jobs ignored cancellation, aborting workers"
            );
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
        }
        Err(Error::Timeout(format!(
            "worker pool did not drain within {deadline:?}"
        )))
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            active: c.active.load(Ordering::SeqCst),
        }
    }

    /// Jobs currently running.
    pub fn active_count(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    /// Token observed by every running job.
    pub fn token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Whether the pool still accepts jobs.
    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some() && !self.cancellation_token.is_cancelled()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(mut tasks) = self.tasks.get_mut().take() {
            self.cancellation_token.cancel();
            tasks.abort_all();
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: SharedReceiver,
    token: CancellationToken,
    counters: Arc<Counters>,
) {
    debug!(worker_id, "worker started");
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            job = async { receiver.lock().await.recv().await } => job,
        };
        let Some(QueuedJob { sequence, job }) = next else {
            break;
        };

        let (name, run) = job.into_parts();
        let ctx = JobContext {
            worker_id,
            sequence,
            token: token.clone(),
        };

        counters.active.fetch_add(1, Ordering::SeqCst);
        debug!(worker_id, sequence, job = %name, "job started");
        let outcome = AssertUnwindSafe(async move { run(ctx).await })
            .catch_unwind()
            .await;
        counters.active.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok(Ok(())) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                debug!(worker_id, sequence, job = %name, "job completed");
            }
            Ok(Err(e)) if e.is_cancelled() => {
                counters.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(worker_id, sequence, job = %name, "job cancelled");
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker_id, sequence, job = %name, error = %e, "job failed");
            }
            Err(panic) => {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker_id,
                    sequence,
                    job = %name,
                    panic = panic_message(&*panic),
                    "job panicked"
                );
            }
        }
    }
    debug!(worker_id, "worker stopped");
}

async fn join_workers(join_set: &mut JoinSet<()>) {
    while let Some(joined) = join_set.join_next().await {
        if let Err(e) = joined
            && e.is_panic()
        {
            error!("worker task panicked outside a job");
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
