//! Agent configuration.
//!
//! Sources, later ones winning: built-in defaults, a JSON file named by
//! `REELFETCH_CONFIG`, then `REELFETCH_*` environment variables (a `.env` file
//! in the working directory is loaded first).

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::admission::RateLimiterConfig;
use crate::downloader::FfmpegConfig;
use crate::library::NamingConfig;
use crate::logging::LoggingSettings;
use crate::media::WatchTask;
use crate::pipeline::WorkerPoolConfig;
use crate::utils::fs::io_error;
use crate::{Error, Result};

/// Environment variable naming the JSON config file.
pub const CONFIG_PATH_ENV: &str = "REELFETCH_CONFIG";

/// Provider request throttling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub requests_per_second: f64,
    /// Burst capacity as a multiple of `requests_per_second`.
    pub burst: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_second: 5.0,
            burst: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Root of the media library.
    pub library_root: PathBuf,
    pub pool: WorkerPoolConfig,
    pub ffmpeg: FfmpegConfig,
    /// Media file extension, e.g. `mkv`.
    pub container: String,
    pub rate_limit: RateLimitSettings,
    pub naming: NamingConfig,
    /// JSON catalog served by the built-in catalog provider.
    pub catalog_path: Option<PathBuf>,
    pub watch: Vec<WatchTask>,
    /// How long shutdown waits for in-flight downloads.
    pub drain_deadline_secs: u64,
    /// Per-subscriber message buffer.
    pub mailbox_capacity: usize,
    pub logging: LoggingSettings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            library_root: PathBuf::from("library"),
            pool: WorkerPoolConfig::default(),
            ffmpeg: FfmpegConfig::default(),
            container: "mkv".to_string(),
            rate_limit: RateLimitSettings::default(),
            naming: NamingConfig::default(),
            catalog_path: None,
            watch: Vec::new(),
            drain_deadline_secs: 30,
            mailbox_capacity: crate::dispatcher::DEFAULT_MAILBOX_CAPACITY,
            logging: LoggingSettings::default(),
        }
    }
}

impl AgentConfig {
    /// Load from `.env`, the optional config file and the process environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment.
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| io_error("reading config", path, e))?;
        let config = serde_json::from_slice(&bytes)
            .map_err(|e| Error::config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("REELFETCH_LIBRARY") {
            self.library_root = PathBuf::from(v);
        }
        if let Some(v) = parsed(lookup, "REELFETCH_CONCURRENCY")? {
            self.pool.max_workers = v;
        }
        if let Some(v) = parsed(lookup, "REELFETCH_QUEUE_CAPACITY")? {
            self.pool.queue_capacity = v;
        }
        if let Some(v) = lookup("REELFETCH_FFMPEG").or_else(|| lookup("FFMPEG_PATH")) {
            self.ffmpeg.binary_path = v;
        }
        if let Some(v) = lookup("REELFETCH_CONTAINER") {
            self.container = v;
        }
        let watchdog_secs: Option<f64> = parsed(lookup, "REELFETCH_WATCHDOG_SECS")?;
        if let Some(secs) = watchdog_secs {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(Error::config(format!(
                    "REELFETCH_WATCHDOG_SECS must be positive, got {secs}"
                )));
            }
            self.ffmpeg.watchdog_interval_ms = (secs * 1000.0).round() as u64;
        }
        if let Some(v) = parsed(lookup, "REELFETCH_RATE_LIMIT")? {
            self.rate_limit.requests_per_second = v;
        }
        if let Some(v) = parsed(lookup, "REELFETCH_RATE_BURST")? {
            self.rate_limit.burst = v;
        }
        if let Some(v) = lookup("REELFETCH_CATALOG") {
            self.catalog_path = Some(PathBuf::from(v));
        }
        if let Some(v) = parsed(lookup, "REELFETCH_DRAIN_SECS")? {
            self.drain_deadline_secs = v;
        }
        if let Some(v) = lookup("REELFETCH_LOG_DIR") {
            self.logging.directory = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.library_root.as_os_str().is_empty() {
            return Err(Error::config("library_root must not be empty"));
        }
        if self.pool.max_workers == 0 {
            return Err(Error::config("pool.max_workers must be at least 1"));
        }
        if self.pool.queue_capacity == 0 {
            return Err(Error::config("pool.queue_capacity must be at least 1"));
        }
        if self.ffmpeg.watchdog_interval_ms == 0 {
            return Err(Error::config("ffmpeg.watchdog_interval_ms must be non-zero"));
        }
        if self.mailbox_capacity == 0 {
            return Err(Error::config("mailbox_capacity must be at least 1"));
        }
        if self.container.contains(['/', '\\']) {
            return Err(Error::config(format!("invalid container {:?}", self.container)));
        }
        self.rate_limiter_config()?;
        Ok(())
    }

    pub fn rate_limiter_config(&self) -> Result<RateLimiterConfig> {
        RateLimiterConfig::with_rps(self.rate_limit.requests_per_second, self.rate_limit.burst)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_secs(self.drain_deadline_secs)
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::config(format!("{key}={raw:?}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::load_with(env(&[])).unwrap();
        assert_eq!(config.container, "mkv");
        assert_eq!(config.ffmpeg.watchdog_interval(), Duration::from_secs(60));
        let limiter = config.rate_limiter_config().unwrap();
        assert_eq!(limiter.refill_rate, 5.0);
        assert_eq!(limiter.max_tokens, 10);
        assert!(config.pool.max_workers >= 1);
    }

    #[test]
    fn test_file_then_env_overrides() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("reelfetch.json");
        std::fs::write(
            &path,
            r#"{
                "library_root": "/srv/media",
                "pool": { "max_workers": 3 },
                "container": "mp4",
                "watch": [ { "provider": "catalog", "title": "Night Trains" } ]
            }"#,
        )
        .unwrap();

        let config = AgentConfig::load_with(env(&[
            (CONFIG_PATH_ENV, path.to_str().unwrap()),
            ("REELFETCH_CONCURRENCY", "2"),
            ("REELFETCH_WATCHDOG_SECS", "0.5"),
            ("FFMPEG_PATH", "/opt/ffmpeg"),
        ]))
        .unwrap();

        assert_eq!(config.library_root, PathBuf::from("/srv/media"));
        assert_eq!(config.container, "mp4");
        assert_eq!(config.pool.max_workers, 2);
        assert_eq!(config.pool.queue_capacity, 16);
        assert_eq!(config.ffmpeg.watchdog_interval_ms, 500);
        assert_eq!(config.ffmpeg.binary_path, "/opt/ffmpeg");
        assert_eq!(config.watch.len(), 1);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(AgentConfig::load_with(env(&[("REELFETCH_CONCURRENCY", "0")])).is_err());
        assert!(AgentConfig::load_with(env(&[("REELFETCH_CONCURRENCY", "many")])).is_err());
        assert!(AgentConfig::load_with(env(&[("REELFETCH_RATE_LIMIT", "0")])).is_err());
        assert!(AgentConfig::load_with(env(&[("REELFETCH_WATCHDOG_SECS", "-1")])).is_err());
        assert!(AgentConfig::load_with(env(&[("REELFETCH_LIBRARY", "")])).is_err());
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = AgentConfig::load_with(env(&[(CONFIG_PATH_ENV, "/nonexistent/reelfetch.json")]))
            .unwrap_err();
        assert!(err.to_string().contains("reelfetch.json"));
    }
}
