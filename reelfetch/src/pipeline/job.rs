//! Units of work executed by the [`WorkerPool`](super::WorkerPool).

use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Context handed to a running job.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Index of the worker running the job.
    pub worker_id: usize,
    /// Submission order, starting at 1.
    pub sequence: u64,
    /// Cancelled when the pool shuts down or its parent token fires.
    pub token: CancellationToken,
}

type JobFn = Box<dyn FnOnce(JobContext) -> BoxFuture<'static, Result<()>> + Send>;

/// An opaque, named unit of work.
///
/// The job reports its own failures to interested parties; the pool only
/// logs the outcome.
pub struct Job {
    name: String,
    run: JobFn,
}

impl Job {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(move |ctx| Box::pin(f(ctx))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn into_parts(self) -> (String, JobFn) {
        (self.name, self.run)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Sequenced job waiting in the queue.
pub(super) struct QueuedJob {
    pub sequence: u64,
    pub job: Job,
}
