//! Stream downloader abstraction.
//!
//! A [`StreamDownloader`] fetches one media item into a destination file. It
//! reports through two narrow capabilities, [`ProgressSink`] and [`EventLog`],
//! so engines stay independent of the message bus and the logging backend.

mod ffmpeg;
pub mod utils;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;

pub use ffmpeg::{FfmpegConfig, FfmpegDownloader, probe_version};

/// Receives progress updates (`current` and projected `total`, in bytes).
pub trait ProgressSink: Send + Sync {
    fn progress(&self, current: u64, total: u64);
}

/// Severity for [`EventLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Receives diagnostic log lines from an engine.
pub trait EventLog: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// [`EventLog`] adapter onto `tracing`, tagged with the item being fetched.
#[derive(Debug, Clone)]
pub struct TracingLog {
    item: String,
}

impl TracingLog {
    pub fn new(item: impl Into<String>) -> Self {
        Self { item: item.into() }
    }
}

impl EventLog for TracingLog {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(item = %self.item, "{message}"),
            LogLevel::Info => tracing::info!(item = %self.item, "{message}"),
            LogLevel::Warn => tracing::warn!(item = %self.item, "{message}"),
            LogLevel::Error => tracing::error!(item = %self.item, "{message}"),
        }
    }
}

/// Capability that downloads one stream into a file.
#[async_trait]
pub trait StreamDownloader: Send {
    /// Attach the log receiver used during [`download`](Self::download).
    fn set_logger(&mut self, logger: Arc<dyn EventLog>);

    /// Attach the progress receiver used during [`download`](Self::download).
    fn set_progress(&mut self, sink: Arc<dyn ProgressSink>);

    /// Download into `destination`.
    ///
    /// Returns [`Error::Cancelled`](crate::Error::Cancelled) promptly once
    /// `token` fires and [`Error::Timeout`](crate::Error::Timeout) when the
    /// transfer stalls. Partial output is left for the caller to clean up.
    async fn download(&mut self, token: CancellationToken, destination: &Path) -> Result<()>;
}
