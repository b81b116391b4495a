//! Media descriptors flowing through the pipeline.
//!
//! A [`MediaInfo`] is produced by a provider and is immutable from the
//! pipeline's point of view. Show and season descriptors are shared between all
//! episodes of the same show/season through `Arc`.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::downloader::StreamDownloader;

/// Kind of media a descriptor refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Collection,
    Series,
    #[default]
    TvShow,
    Movie,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collection => "collection",
            Self::Series => "series",
            Self::TvShow => "tv_show",
            Self::Movie => "movie",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An artwork reference attached to a show or season.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Artwork role, e.g. `poster`, `fanart`, `thumb`.
    pub kind: String,
    pub url: String,
}

/// Show-level metadata, written once as `show.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShowInfo {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Image>,
}

/// Season-level metadata, written once as `season.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeasonInfo {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Image>,
}

/// Descriptor of one downloadable unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Provider-scoped unique identifier, used for deduplication.
    pub id: String,
    pub show: String,
    #[serde(default)]
    pub season: u32,
    #[serde(default)]
    pub episode: u32,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aired: Option<NaiveDate>,
    #[serde(default)]
    pub kind: MediaKind,
    #[serde(default)]
    pub is_bonus: bool,
    /// Playable stream URLs (video first, then any separate audio/subtitle tracks).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stream_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_info: Option<Arc<ShowInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season_info: Option<Arc<SeasonInfo>>,
}

impl MediaInfo {
    /// Short label for logs and user-facing messages.
    pub fn display_name(&self) -> String {
        match self.kind {
            MediaKind::Movie => self.title.clone(),
            _ if self.is_bonus || self.season == 0 => format!("{} - {}", self.show, self.title),
            _ => format!(
                "{} S{:02}E{:02} - {}",
                self.show, self.season, self.episode, self.title
            ),
        }
    }
}

/// One entry of the watch list: a show to poll on a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTask {
    /// Name of the provider serving this show.
    pub provider: String,
    pub title: String,
    /// Provider-side show identifier; matched before `title` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_id: Option<String>,
    /// Upper bound on items produced per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
}

/// One media item bound to the capability that can fetch it.
///
/// Created by a provider, consumed exactly once by the materializer.
pub struct DownloadItem {
    pub media: MediaInfo,
    pub downloader: Box<dyn StreamDownloader>,
}

impl DownloadItem {
    pub fn new(media: MediaInfo, downloader: Box<dyn StreamDownloader>) -> Self {
        Self { media, downloader }
    }
}

impl fmt::Debug for DownloadItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadItem")
            .field("media", &self.media.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name() {
        let mut media = MediaInfo {
            id: "ep-1".into(),
            show: "Night Trains".into(),
            season: 2,
            episode: 7,
            title: "Crossing".into(),
            ..Default::default()
        };
        assert_eq!(media.display_name(), "Night Trains S02E07 - Crossing");

        media.is_bonus = true;
        assert_eq!(media.display_name(), "Night Trains - Crossing");

        media.kind = MediaKind::Movie;
        assert_eq!(media.display_name(), "Crossing");
    }

    #[test]
    fn test_media_info_deserializes_with_defaults() {
        let media: MediaInfo = serde_json::from_str(
            r#"{"id":"x","show":"S","title":"T","aired":"2024-03-01","kind":"movie"}"#,
        )
        .unwrap();
        assert_eq!(media.kind, MediaKind::Movie);
        assert_eq!(media.aired, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert!(media.stream_urls.is_empty());
        assert!(media.show_info.is_none());
    }
}
