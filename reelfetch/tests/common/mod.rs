//! Shared fixtures for pipeline integration tests.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use reelfetch::dispatcher::{Dispatcher, Message, MessageStatus, Subscription};
use reelfetch::downloader::FfmpegConfig;

/// Marker placed in a stream URL to make the fake ffmpeg fail.
pub const FAIL_MARKER: &str = "__fail__";
/// Marker placed in a stream URL to make the fake ffmpeg hang.
pub const HANG_MARKER: &str = "__hang__";

/// Temporary workspace with a library directory and a fake ffmpeg.
pub struct Fixture {
    pub temp: TempDir,
    pub library: PathBuf,
    pub ffmpeg: PathBuf,
    pub invocations: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let library = temp.path().join("library");
        std::fs::create_dir_all(&library).unwrap();
        let invocations = temp.path().join("invocations.log");
        let ffmpeg = temp.path().join("ffmpeg.sh");

        // Last argument is the output; URLs decide the behaviour.
        let script = format!(
            r#"#!/bin/sh
for last; do :; done
echo "$last" >> '{log}'
case "$*" in
  *{fail}*)
    echo "Input #0, hls, from 'https://cdn/stream.m3u8':" >&2
    echo "https://cdn/stream.m3u8: Server returned 404 Not Found" >&2
    exit 1
    ;;
  *{hang}*)
    echo partial > "$last"
    echo "  Duration: 00:00:10.00, start: 0.000000, bitrate: 800 kb/s" >&2
    exec sleep 30
    ;;
esac
echo "  Duration: 00:00:10.00, start: 0.000000, bitrate: 800 kb/s" >&2
printf 'size=      50kB time=00:00:05.00 bitrate=80.0kbits/s speed=10.0x\r' >&2
printf 'size=     100kB time=00:00:10.00 bitrate=80.0kbits/s speed=10.0x\n' >&2
echo media > "$last"
"#,
            log = invocations.display(),
            fail = FAIL_MARKER,
            hang = HANG_MARKER,
        );
        std::fs::write(&ffmpeg, script).unwrap();
        std::fs::set_permissions(&ffmpeg, std::fs::Permissions::from_mode(0o755)).unwrap();

        Self {
            temp,
            library,
            ffmpeg,
            invocations,
        }
    }

    pub fn ffmpeg_config(&self, watchdog: Duration) -> Arc<FfmpegConfig> {
        Arc::new(FfmpegConfig {
            binary_path: self.ffmpeg.to_string_lossy().to_string(),
            watchdog_interval_ms: watchdog.as_millis() as u64,
            ..Default::default()
        })
    }

    /// Number of times the fake ffmpeg was started.
    pub fn invocation_count(&self) -> usize {
        std::fs::read_to_string(&self.invocations)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    pub fn write_catalog(&self, json: &str) -> PathBuf {
        let path = self.temp.path().join("catalog.json");
        std::fs::write(&path, json).unwrap();
        path
    }
}

/// Records every message delivered to one subscriber.
pub struct Recorder {
    pub messages: Arc<Mutex<Vec<Message>>>,
    _subscription: Subscription,
}

impl Recorder {
    pub fn attach(dispatcher: &Dispatcher) -> Self {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();
        let subscription = dispatcher.subscribe(move |m: &Message| sink.lock().push(m.clone()));
        Self {
            messages,
            _subscription: subscription,
        }
    }

    pub fn pinned_errors(&self) -> Vec<Message> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.status == MessageStatus::Error && m.pinned)
            .cloned()
            .collect()
    }

    /// Give forwarding tasks time to deliver.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Every file below `root`, relative to it, sorted.
pub fn files_under(root: &Path) -> Vec<String> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, root, out);
            } else {
                out.push(path.strip_prefix(root).unwrap().to_string_lossy().to_string());
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}
