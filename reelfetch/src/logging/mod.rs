//! Logging setup.
//!
//! Console and daily-rolling file output, local-time timestamps and a
//! background task that prunes rolled files past the retention period.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::utils::fs;
use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "reelfetch=info,process_utils=info";

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Directory for rolled log files.
    pub directory: PathBuf,
    /// File name prefix; files are named `<prefix>.YYYY-MM-DD`.
    pub file_prefix: String,
    /// Days to keep rolled files.
    pub retention_days: u32,
    /// Filter directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub console: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            file_prefix: "reelfetch.log".to_string(),
            retention_days: 7,
            filter: DEFAULT_LOG_FILTER.to_string(),
            console: true,
        }
    }
}

/// Timestamps in the local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the lifetime of the process, or buffered
/// file output is lost.
pub fn init_logging(settings: &LoggingSettings) -> Result<WorkerGuard> {
    fs::ensure_dir_all_sync_with_op("creating log directory", &settings.directory)?;

    let file_appender = tracing_appender::rolling::daily(&settings.directory, &settings.file_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.filter))
        .map_err(|e| Error::config(format!("invalid log filter {:?}: {e}", settings.filter)))?;

    let console = settings
        .console
        .then(|| fmt::layer().with_ansi(true).with_timer(LocalTimer));

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .map_err(|e| Error::Other(format!("failed to set global default subscriber: {e}")))?;

    Ok(guard)
}

/// Prune old logs now and then once a day until `token` is cancelled.
pub fn start_retention_cleanup(settings: &LoggingSettings, token: CancellationToken) {
    let dir = settings.directory.clone();
    let prefix = settings.file_prefix.clone();
    let retention_days = settings.retention_days;

    tokio::spawn(async move {
        let interval = Duration::from_secs(24 * 60 * 60);
        loop {
            match cleanup_old_logs(&dir, &prefix, retention_days, Local::now().date_naive()).await
            {
                Ok(0) => {}
                Ok(count) => info!(count, "cleaned up old log files"),
                Err(e) => warn!(error = %e, "failed to clean up old logs"),
            }
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("log retention task shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    });
}

/// Delete `<prefix>.YYYY-MM-DD` files dated more than `retention_days`
/// before `today`. Returns the number of deleted files.
pub async fn cleanup_old_logs(
    dir: &Path,
    prefix: &str,
    retention_days: u32,
    today: NaiveDate,
) -> Result<usize> {
    let cutoff = today - chrono::Days::new(u64::from(retention_days));
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| fs::io_error("reading log directory", dir, e))?;

    let mut deleted = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| fs::io_error("reading log directory", dir, e))?
    {
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(prefix))
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        else {
            continue;
        };
        if date < cutoff && fs::remove_file_if_exists(&path).await? {
            debug!(path = %path.display(), "deleted old log file");
            deleted += 1;
        }
    }
    Ok(deleted)
}
