//! File-backed catalog provider.
//!
//! Reads a JSON document describing shows, seasons and episodes with their
//! stream URLs, and produces items downloaded with ffmpeg.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{Candidate, Provider, ProviderContext};
use crate::downloader::{FfmpegConfig, FfmpegDownloader};
use crate::media::{DownloadItem, Image, MediaInfo, MediaKind, SeasonInfo, ShowInfo, WatchTask};
use crate::utils::fs::io_error;
use crate::{Error, Result};

/// Root of a catalog document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub shows: Vec<CatalogShow>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogShow {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Image>,
    #[serde(default)]
    pub seasons: Vec<CatalogSeason>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSeason {
    pub number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Image>,
    #[serde(default)]
    pub episodes: Vec<CatalogEpisode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogEpisode {
    pub id: String,
    #[serde(default)]
    pub episode: u32,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aired: Option<NaiveDate>,
    #[serde(default)]
    pub is_bonus: bool,
    #[serde(default)]
    pub stream_urls: Vec<String>,
}

impl CatalogShow {
    fn matches(&self, task: &WatchTask) -> bool {
        match task.show_id {
            Some(ref id) => self.id == *id,
            None => self.title.eq_ignore_ascii_case(task.title.trim()),
        }
    }

    fn info(&self) -> ShowInfo {
        ShowInfo {
            id: self.id.clone(),
            title: self.title.clone(),
            plot: self.plot.clone(),
            images: self.images.clone(),
        }
    }
}

impl CatalogSeason {
    fn info(&self, show: &CatalogShow) -> SeasonInfo {
        SeasonInfo {
            id: self
                .id
                .clone()
                .unwrap_or_else(|| format!("{}-s{:02}", show.id, self.number)),
            title: self
                .title
                .clone()
                .unwrap_or_else(|| format!("Season {}", self.number)),
            number: self.number,
            plot: self.plot.clone(),
            images: self.images.clone(),
        }
    }
}

/// [`Provider`] backed by a local JSON catalog.
pub struct CatalogProvider {
    name: String,
    path: PathBuf,
    ffmpeg: Arc<FfmpegConfig>,
}

impl CatalogProvider {
    pub const DEFAULT_NAME: &'static str = "catalog";

    pub fn new(path: impl Into<PathBuf>, ffmpeg: Arc<FfmpegConfig>) -> Self {
        Self {
            name: Self::DEFAULT_NAME.to_string(),
            path: path.into(),
            ffmpeg,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self, ctx: &ProviderContext) -> Result<CatalogFile> {
        ctx.throttle().await?;
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| io_error("reading catalog", &self.path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn item(&self, media: MediaInfo) -> DownloadItem {
        let downloader = FfmpegDownloader::new(self.ffmpeg.clone(), media.stream_urls.clone());
        DownloadItem::new(media, Box::new(downloader))
    }
}

#[async_trait]
impl Provider for CatalogProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, ctx: &ProviderContext, query: &str) -> Result<Vec<Candidate>> {
        let catalog = self.load(ctx).await?;
        let needle = query.trim().to_lowercase();
        Ok(catalog
            .shows
            .into_iter()
            .filter(|s| s.title.to_lowercase().contains(&needle))
            .map(|s| Candidate {
                provider: self.name.clone(),
                id: s.id,
                title: s.title,
                kind: s.kind,
            })
            .collect())
    }

    async fn get_medias(
        &self,
        ctx: &ProviderContext,
        task: &WatchTask,
        items: mpsc::Sender<DownloadItem>,
    ) -> Result<()> {
        let catalog = self.load(ctx).await?;
        let show = catalog
            .shows
            .iter()
            .find(|s| s.matches(task))
            .ok_or_else(|| Error::validation(format!("show {:?} not in catalog", task.title)))?;

        let show_info = Arc::new(show.info());
        let limit = task.max_items.unwrap_or(usize::MAX);
        let mut sent = 0usize;

        for season in &show.seasons {
            let season_info = Arc::new(season.info(show));
            for episode in &season.episodes {
                if sent >= limit {
                    debug!(show = %show.title, limit, "item limit reached");
                    return Ok(());
                }
                // Resolving an episode counts as one upstream request.
                ctx.throttle().await?;

                let media = MediaInfo {
                    id: episode.id.clone(),
                    show: show.title.clone(),
                    season: season.number,
                    episode: episode.episode,
                    title: episode.title.clone(),
                    aired: episode.aired,
                    kind: show.kind,
                    is_bonus: episode.is_bonus,
                    stream_urls: episode.stream_urls.clone(),
                    show_info: Some(show_info.clone()),
                    season_info: Some(season_info.clone()),
                };

                tokio::select! {
                    _ = ctx.token.cancelled() => return Err(Error::Cancelled),
                    sent_item = items.send(self.item(media)) => {
                        if sent_item.is_err() {
                            debug!(show = %show.title, "item receiver closed");
                            return Ok(());
                        }
                    }
                }
                sent += 1;
            }
        }
        info!(provider = %self.name, show = %show.title, items = sent, "catalog scan finished");
        Ok(())
    }
}
