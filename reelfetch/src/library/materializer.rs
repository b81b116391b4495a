//! Turns download items into complete library entries.
//!
//! Every item is materialized inside one [`Batch`]: directories, metadata
//! sidecars and the media file are either all present when
//! [`Materializer::download_one`] returns `Ok`, or none of what this call
//! created is left behind.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::claims::{ClaimGuard, FolderClaims};
use super::naming::PathNamer;
use crate::batch::{self, Action, Batch, Undo};
use crate::dispatcher::{Dispatcher, Message, MessageStatus, Progress};
use crate::downloader::{ProgressSink, StreamDownloader, TracingLog};
use crate::media::{DownloadItem, MediaInfo, SeasonInfo, ShowInfo};
use crate::{Error, Result};

pub const SHOW_METADATA_FILE: &str = "show.json";
pub const SEASON_METADATA_FILE: &str = "season.json";

/// Resolved on-disk locations for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemPaths {
    pub show_dir: PathBuf,
    pub season_dir: PathBuf,
    /// Episode metadata sidecar, `<name>.json`.
    pub sidecar: PathBuf,
    /// Final media file, `<name>.<ext>`.
    pub media_file: PathBuf,
}

/// Outcome counts of [`Materializer::download`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeSummary {
    pub completed: usize,
    pub failed: usize,
}

/// Per-item orchestration of naming, metadata, download and notifications.
pub struct Materializer {
    root: PathBuf,
    namer: Arc<dyn PathNamer>,
    dispatcher: Dispatcher,
    extension: String,
    claims: FolderClaims,
}

impl Materializer {
    pub fn new(
        root: impl Into<PathBuf>,
        namer: Arc<dyn PathNamer>,
        dispatcher: Dispatcher,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            namer,
            dispatcher,
            extension: extension.into().trim_start_matches('.').to_string(),
            claims: FolderClaims::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve and validate every path for `media`.
    ///
    /// A naming strategy that yields an empty or multi-component name is a
    /// contract violation and fails with [`Error::Validation`].
    pub fn paths(&self, media: &MediaInfo) -> Result<ItemPaths> {
        let show = checked_component("show path", self.namer.show_path(media))?;
        let season = checked_component("season path", self.namer.season_path(media))?;
        let name = checked_component("file name", self.namer.file_name(media))?;

        let show_dir = self.root.join(show);
        let season_dir = show_dir.join(season);
        let sidecar = season_dir.join(format!("{name}.json"));
        let media_file = if self.extension.is_empty() {
            season_dir.join(&name)
        } else {
            season_dir.join(format!("{name}.{}", self.extension))
        };
        Ok(ItemPaths {
            show_dir,
            season_dir,
            sidecar,
            media_file,
        })
    }

    /// Final media file path for `media`.
    pub fn destination(&self, media: &MediaInfo) -> Result<PathBuf> {
        Ok(self.paths(media)?.media_file)
    }

    /// Materialize one item.
    ///
    /// The item's progress message ends as an unpinned success, or as a
    /// pinned error once the batch has been rolled back. Cancellation is
    /// reported the same way.
    pub async fn download_one(&self, token: CancellationToken, item: DownloadItem) -> Result<()> {
        let name = item.media.display_name();
        let mut run = ItemRun {
            batch: Batch::new(name.clone()),
            claim: None,
            progress: Arc::new(MessageProgress::new(
                self.dispatcher.clone(),
                Message::info(format!("Downloading {name}"))
                    .pinned()
                    .with_progress(0, 0),
            )),
        };

        let result = self.materialize(&token, item, &mut run).await;
        let ItemRun {
            mut batch,
            claim,
            progress,
        } = run;
        match result {
            Ok(paths) => {
                if let Some(ref claim) = claim {
                    claim.settle();
                }
                batch.commit();
                drop(claim);
                info!(item = %name, path = %paths.media_file.display(), "item materialized");
                progress.finish(format!("Downloaded {name}"));
                Ok(())
            }
            Err(e) => {
                // Already reverted when a step failed; a no-op then.
                batch.rollback().await;
                drop(claim);
                if e.is_cancelled() {
                    info!(item = %name, "download cancelled");
                } else {
                    warn!(item = %name, error = %e, "download failed");
                }
                progress.fail(format!("Failed to download {name}: {e}"));
                Err(e)
            }
        }
    }

    async fn materialize(
        &self,
        token: &CancellationToken,
        item: DownloadItem,
        run: &mut ItemRun,
    ) -> Result<ItemPaths> {
        let DownloadItem {
            media,
            mut downloader,
        } = item;
        let paths = self.paths(&media)?;
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let show_info = media.show_info.as_deref().cloned().unwrap_or_else(|| ShowInfo {
            title: media.show.clone(),
            ..Default::default()
        });
        let season_info = media.season_info.as_deref().cloned().unwrap_or_else(|| SeasonInfo {
            title: format!("Season {}", media.season),
            number: media.season,
            ..Default::default()
        });

        // Held by the caller until the batch is committed or rolled back.
        run.claim = Some(
            self.claims
                .claim(&[paths.show_dir.as_path(), paths.season_dir.as_path()]),
        );
        let batch = &mut run.batch;

        batch.perform(batch::create_dir_all(&paths.show_dir)).await?;
        batch
            .perform(self.claims.write_metadata(
                &paths.show_dir,
                paths.show_dir.join(SHOW_METADATA_FILE),
                &show_info,
            )?)
            .await?;
        // A concurrent rollback may have removed an emptied show folder.
        batch.perform(batch::create_dir_all(&paths.season_dir)).await?;
        batch
            .perform(self.claims.write_metadata(
                &paths.season_dir,
                paths.season_dir.join(SEASON_METADATA_FILE),
                &season_info,
            )?)
            .await?;
        batch
            .perform(batch::write_json(&paths.sidecar, &media)?)
            .await?;

        run.progress.publish_initial();
        batch.perform(batch::track_file(&paths.media_file)).await?;

        downloader.set_logger(Arc::new(TracingLog::new(media.display_name())));
        downloader.set_progress(run.progress.clone());
        batch
            .perform(FetchStream {
                downloader,
                token: token.clone(),
                destination: paths.media_file.clone(),
            })
            .await?;

        Ok(paths)
    }

    /// Consume items from `items` one at a time until the channel closes or
    /// `token` is cancelled.
    pub async fn download(
        &self,
        token: CancellationToken,
        mut items: mpsc::Receiver<DownloadItem>,
    ) -> MaterializeSummary {
        let mut summary = MaterializeSummary::default();
        loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                item = items.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            match self.download_one(token.clone(), item).await {
                Ok(()) => summary.completed += 1,
                Err(_) => summary.failed += 1,
            }
        }
        debug!(?summary, "materializer loop finished");
        summary
    }
}

/// Per-item state that outlives [`Materializer::materialize`], so that
/// cleanup and the final message happen after every step returned.
struct ItemRun {
    batch: Batch,
    claim: Option<ClaimGuard>,
    progress: Arc<MessageProgress>,
}

fn checked_component(what: &str, value: String) -> Result<String> {
    let mut components = Path::new(&value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(value),
        _ => Err(Error::validation(format!(
            "naming strategy returned an invalid {what}: {value:?}"
        ))),
    }
}

/// Runs the stream download as a batch step.
///
/// The produced file is already covered by the preceding `track_file` step,
/// so this step has nothing of its own to undo.
struct FetchStream {
    downloader: Box<dyn StreamDownloader>,
    token: CancellationToken,
    destination: PathBuf,
}

#[async_trait]
impl Action for FetchStream {
    fn describe(&self) -> String {
        format!("download {}", self.destination.display())
    }

    async fn apply(self: Box<Self>) -> Result<Option<Box<dyn Undo>>> {
        let Self {
            mut downloader,
            token,
            destination,
        } = *self;
        downloader.download(token, &destination).await?;
        Ok(None)
    }
}

/// [`ProgressSink`] that republishes one message as progress arrives.
///
/// `current` never moves backwards; once `current >= total` the message flips
/// to an unpinned success and later updates are ignored.
struct MessageProgress {
    dispatcher: Dispatcher,
    message: Mutex<Message>,
}

impl MessageProgress {
    fn new(dispatcher: Dispatcher, message: Message) -> Self {
        Self {
            dispatcher,
            message: Mutex::new(message),
        }
    }

    fn publish_initial(&self) {
        let message = self.message.lock().clone();
        self.dispatcher.publish(message);
    }

    /// Turn the message into an unpinned success.
    fn finish(&self, text: String) {
        let mut message = self.message.lock();
        message.status = MessageStatus::Success;
        message.pinned = false;
        message.text = text;
        if let Some(ref mut p) = message.progress {
            p.current = p.current.max(p.total);
            p.total = p.current;
        }
        message.touch();
        self.dispatcher.publish(message.clone());
    }

    /// Turn the message into a pinned error. Overrides a success reached by
    /// progress alone, since the item was rolled back.
    fn fail(&self, text: String) {
        let mut message = self.message.lock();
        message.status = MessageStatus::Error;
        message.pinned = true;
        message.text = text;
        message.touch();
        self.dispatcher.publish(message.clone());
    }
}

impl ProgressSink for MessageProgress {
    fn progress(&self, current: u64, total: u64) {
        let mut message = self.message.lock();
        if message.status != MessageStatus::Info {
            return;
        }
        let previous = message.progress.map(|p| p.current).unwrap_or(0);
        if current < previous {
            return;
        }
        let total = total.max(current);
        message.progress = Some(Progress::new(current, total));
        if total > 0 && current >= total {
            message.status = MessageStatus::Success;
            message.pinned = false;
        }
        message.touch();
        // Publishing under the lock keeps updates for this item in order.
        self.dispatcher.publish(message.clone());
    }
}
