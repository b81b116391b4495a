//! Content providers.
//!
//! A provider turns a [`WatchTask`] into a stream of [`DownloadItem`]s. How it
//! discovers them is its own business; the pipeline only sees the channel.
//! Providers are registered explicitly at startup in a [`ProviderRegistry`].

mod catalog;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::admission::RateLimiter;
use crate::media::{DownloadItem, MediaKind, WatchTask};
use crate::{Error, Result};

pub use catalog::{CatalogFile, CatalogProvider};

/// A search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub provider: String,
    pub id: String,
    pub title: String,
    pub kind: MediaKind,
}

/// Per-call context handed to a provider.
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub token: CancellationToken,
    pub rate_limiter: Arc<RateLimiter>,
}

impl ProviderContext {
    pub fn new(token: CancellationToken, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            token,
            rate_limiter,
        }
    }

    /// Wait for the rate limiter; call before every upstream request.
    pub async fn throttle(&self) -> Result<()> {
        self.rate_limiter.acquire(&self.token).await.map(|_| ())
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Unique name referenced by [`WatchTask::provider`].
    fn name(&self) -> &str;

    /// Look up shows matching `query`.
    async fn search(&self, ctx: &ProviderContext, query: &str) -> Result<Vec<Candidate>>;

    /// Send every item of `task` into `items`.
    ///
    /// Returns once all items were sent, the receiver went away, or
    /// `ctx.token` was cancelled.
    async fn get_medias(
        &self,
        ctx: &ProviderContext,
        task: &WatchTask,
        items: mpsc::Sender<DownloadItem>,
    ) -> Result<()>;
}

/// Explicit list of available providers.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider, replacing any previous one with the same name.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.retain(|p| p.name() != provider.name());
        self.providers.push(provider);
    }

    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| Error::ProviderNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
