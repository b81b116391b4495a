//! Admission and deduplication in front of the worker pool.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::library::Materializer;
use crate::media::{DownloadItem, WatchTask};
use crate::pipeline::{Job, WorkerPool};
use crate::provider::{Provider, ProviderContext, ProviderRegistry};
use crate::utils::fs::path_exists;
use crate::{Error, Result};

/// Items buffered between a provider and the runner.
const PROVIDER_BUFFER: usize = 4;

/// What happened to the candidates of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionReport {
    /// Submitted to the pool.
    pub accepted: usize,
    /// Identifier or destination already seen during this run.
    pub duplicates: usize,
    /// Destination file already on disk.
    pub already_present: usize,
    /// Candidates or tasks that could not be processed.
    pub failed: usize,
}

enum Admission {
    Accepted,
    Duplicate,
    Present,
}

/// Feeds provider output into the worker pool.
///
/// The seen-sets live for the lifetime of the runner and are only touched by
/// the task driving [`run`](Self::run).
pub struct AdmissionRunner {
    registry: ProviderRegistry,
    pool: Arc<WorkerPool>,
    materializer: Arc<Materializer>,
    limiter_config: RateLimiterConfig,
    limiters: HashMap<String, Arc<RateLimiter>>,
    seen_ids: HashSet<String>,
    seen_paths: HashSet<PathBuf>,
}

impl AdmissionRunner {
    pub fn new(
        registry: ProviderRegistry,
        pool: Arc<WorkerPool>,
        materializer: Arc<Materializer>,
        limiter_config: RateLimiterConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            materializer,
            limiter_config,
            limiters: HashMap::new(),
            seen_ids: HashSet::new(),
            seen_paths: HashSet::new(),
        }
    }

    /// Process every task in order until done or `token` is cancelled.
    pub async fn run(&mut self, token: &CancellationToken, tasks: &[WatchTask]) -> AdmissionReport {
        let mut report = AdmissionReport::default();
        for task in tasks {
            if token.is_cancelled() {
                break;
            }
            let provider = match self.registry.get(&task.provider) {
                Ok(p) => p,
                Err(e) => {
                    warn!(task = %task.title, error = %e, "skipping watch task");
                    report.failed += 1;
                    continue;
                }
            };
            if let Err(e) = self.run_task(token, provider, task, &mut report).await {
                if e.is_cancelled() {
                    break;
                }
                warn!(task = %task.title, error = %e, "watch task failed");
                report.failed += 1;
            }
        }
        info!(?report, "admission run finished");
        report
    }

    async fn run_task(
        &mut self,
        token: &CancellationToken,
        provider: Arc<dyn Provider>,
        task: &WatchTask,
        report: &mut AdmissionReport,
    ) -> Result<()> {
        let ctx = ProviderContext::new(token.clone(), self.limiter_for(provider.name()));
        let (tx, mut rx) = mpsc::channel(PROVIDER_BUFFER);

        let producer = {
            let provider = provider.clone();
            let task = task.clone();
            tokio::spawn(async move { provider.get_medias(&ctx, &task, tx).await })
        };

        let mut admitted: Result<()> = Ok(());
        loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    admitted = Err(Error::Cancelled);
                    break;
                }
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            match self.admit(provider.name(), item).await {
                Ok(Admission::Accepted) => report.accepted += 1,
                Ok(Admission::Duplicate) => report.duplicates += 1,
                Ok(Admission::Present) => report.already_present += 1,
                Err(e @ (Error::PoolClosed | Error::Cancelled)) => {
                    admitted = Err(e);
                    break;
                }
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "candidate rejected");
                    report.failed += 1;
                }
            }
        }
        // Unblocks a producer still waiting to send.
        drop(rx);

        let produced = match producer.await {
            Ok(result) => result,
            Err(e) => Err(Error::Other(format!("provider task failed: {e}"))),
        };
        admitted?;
        produced
    }

    async fn admit(&mut self, provider: &str, item: DownloadItem) -> Result<Admission> {
        let key = format!("{provider}:{}", item.media.id);
        if !self.seen_ids.insert(key) {
            debug!(id = %item.media.id, "duplicate candidate");
            return Ok(Admission::Duplicate);
        }

        let destination = self.materializer.destination(&item.media)?;
        if !self.seen_paths.insert(destination.clone()) {
            debug!(path = %destination.display(), "destination already claimed this run");
            return Ok(Admission::Duplicate);
        }
        if path_exists(&destination).await? {
            debug!(path = %destination.display(), "already downloaded");
            return Ok(Admission::Present);
        }

        let name = item.media.display_name();
        let materializer = self.materializer.clone();
        self.pool
            .submit(Job::new(name, move |ctx| async move {
                materializer.download_one(ctx.token, item).await
            }))
            .await?;
        Ok(Admission::Accepted)
    }

    fn limiter_for(&mut self, provider: &str) -> Arc<RateLimiter> {
        self.limiters
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new(self.limiter_config)))
            .clone()
    }
}
