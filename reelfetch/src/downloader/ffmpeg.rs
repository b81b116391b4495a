//! FFmpeg-based stream downloader.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::utils::{OutputLine, OutputRecordReader, ProgressTracker};
use super::{EventLog, LogLevel, ProgressSink, StreamDownloader, TracingLog};
use crate::{Error, Result};

/// How long a killed ffmpeg gets to be reaped before we give up waiting.
const KILL_GRACE: Duration = Duration::from_secs(5);

fn default_binary_path() -> String {
    "ffmpeg".to_string()
}

fn default_watchdog_ms() -> u64 {
    60_000
}

/// FFmpeg engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FfmpegConfig {
    /// Path to the ffmpeg binary.
    #[serde(default = "default_binary_path")]
    pub binary_path: String,
    /// Extra arguments placed before the inputs.
    pub input_args: Vec<String>,
    /// Extra arguments placed after `-c copy`.
    pub output_args: Vec<String>,
    pub user_agent: Option<String>,
    /// HTTP headers sent with every input request, as `(name, value)`.
    pub headers: Vec<(String, String)>,
    /// Silence on stderr longer than this is treated as a stall.
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_interval_ms: u64,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary_path: default_binary_path(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            user_agent: None,
            headers: Vec::new(),
            watchdog_interval_ms: default_watchdog_ms(),
        }
    }
}

impl FfmpegConfig {
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(1))
    }
}

/// Detect the ffmpeg version string, `None` when the binary is unusable.
pub async fn probe_version(binary_path: &str) -> Option<String> {
    let output = process_utils::tokio_command(binary_path)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
}

enum Outcome {
    Cancelled,
    Stalled,
    Finished,
}

/// Downloads one item by remuxing its input streams with `-c copy`.
pub struct FfmpegDownloader {
    config: Arc<FfmpegConfig>,
    inputs: Vec<String>,
    logger: Arc<dyn EventLog>,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl FfmpegDownloader {
    /// Create a downloader for the given input URLs (video first).
    pub fn new(config: Arc<FfmpegConfig>, inputs: Vec<String>) -> Self {
        Self {
            config,
            inputs,
            logger: Arc::new(TracingLog::new("ffmpeg")),
            progress: None,
        }
    }

    /// Build the ffmpeg argument list.
    pub fn build_args(&self, destination: &Path) -> Vec<String> {
        let mut args: Vec<String> = ["-y", "-hide_banner", "-nostdin", "-loglevel", "info"]
            .into_iter()
            .map(String::from)
            .collect();

        args.extend(self.config.input_args.iter().cloned());

        if let Some(ref ua) = self.config.user_agent {
            args.extend(["-user_agent".to_string(), ua.clone()]);
        }
        if !self.config.headers.is_empty() {
            let headers: String = self
                .config
                .headers
                .iter()
                .map(|(k, v)| format!("{k}: {v}\r\n"))
                .collect();
            args.extend(["-headers".to_string(), headers]);
        }

        for url in &self.inputs {
            args.extend(["-i".to_string(), url.clone()]);
        }
        // With several inputs, keep every stream of every input.
        if self.inputs.len() > 1 {
            for index in 0..self.inputs.len() {
                args.extend(["-map".to_string(), index.to_string()]);
            }
        }

        args.extend(["-c".to_string(), "copy".to_string()]);
        args.extend(self.config.output_args.iter().cloned());
        args.push(destination.to_string_lossy().to_string());
        args
    }

    async fn terminate(&self, child: &mut Child, reason: &str) {
        self.logger
            .log(LogLevel::Debug, &format!("terminating ffmpeg: {reason}"));
        match process_utils::kill_and_reap(child, KILL_GRACE).await {
            Ok(Some(_)) => {}
            Ok(None) => warn!(reason, "ffmpeg still running after kill"),
            Err(e) => warn!(reason, error = %e, "failed to kill ffmpeg"),
        }
    }
}

#[async_trait]
impl StreamDownloader for FfmpegDownloader {
    fn set_logger(&mut self, logger: Arc<dyn EventLog>) {
        self.logger = logger;
    }

    fn set_progress(&mut self, sink: Arc<dyn ProgressSink>) {
        self.progress = Some(sink);
    }

    async fn download(&mut self, token: CancellationToken, destination: &Path) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(Error::validation("no stream URL to download"));
        }
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let program = self.config.binary_path.clone();
        let args = self.build_args(destination);
        debug!(program = %program, ?args, "spawning ffmpeg");

        let mut child = process_utils::tokio_command(&program)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::process(&program, format!("failed to spawn: {e}")))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::process(&program, "failed to capture stderr"))?;

        let interval = self.config.watchdog_interval();
        let mut reader = OutputRecordReader::new(stderr);
        let mut tracker = ProgressTracker::new();
        let mut last_diagnostic: Option<String> = None;

        let watchdog = tokio::time::sleep(interval);
        tokio::pin!(watchdog);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break Outcome::Cancelled,
                _ = &mut watchdog => break Outcome::Stalled,
                record = reader.next_record() => match record {
                    Ok(Some(line)) => {
                        watchdog.as_mut().reset(Instant::now() + interval);
                        match tracker.feed(&line) {
                            OutputLine::Duration(secs) => {
                                self.logger.log(LogLevel::Debug, &format!("input duration {secs:.2}s"));
                            }
                            OutputLine::Progress(Some(estimate)) => {
                                if let Some(ref sink) = self.progress {
                                    sink.progress(estimate.current, estimate.total);
                                }
                            }
                            OutputLine::Progress(None) => {}
                            OutputLine::Diagnostic => {
                                self.logger.log(LogLevel::Debug, &line);
                                last_diagnostic = Some(line);
                            }
                        }
                    }
                    Ok(None) => break Outcome::Finished,
                    Err(e) => {
                        warn!(error = %e, "failed to read ffmpeg output");
                        break Outcome::Finished;
                    }
                },
            }
        };

        let status = match outcome {
            Outcome::Cancelled => {
                self.terminate(&mut child, "cancelled").await;
                return Err(Error::Cancelled);
            }
            Outcome::Stalled => {
                self.terminate(&mut child, "stalled").await;
                self.logger.log(
                    LogLevel::Warn,
                    &format!("no output for {interval:?}, download considered stalled"),
                );
                return Err(Error::Timeout(format!(
                    "{program} produced no output for {interval:?}"
                )));
            }
            // stderr closed; the exit is still subject to cancellation and the watchdog.
            Outcome::Finished => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.terminate(&mut child, "cancelled").await;
                    return Err(Error::Cancelled);
                }
                _ = &mut watchdog => {
                    self.terminate(&mut child, "stalled after closing output").await;
                    return Err(Error::Timeout(format!("{program} did not exit after closing its output")));
                }
                status = child.wait() => status.map_err(|e| Error::io_path("waiting for", Path::new(&program), e))?,
            },
        };

        if status.success() {
            let total = tracker.processed_bytes();
            if let (Some(sink), true) = (&self.progress, total > 0) {
                sink.progress(total, total);
            }
            let speed = tracker
                .speed()
                .map(|x| format!(", {x:.1}x"))
                .unwrap_or_default();
            self.logger.log(
                LogLevel::Info,
                &format!(
                    "finished {} ({} bytes, {:.1}s of media{speed})",
                    destination.display(),
                    total,
                    tracker.processed_secs()
                ),
            );
            Ok(())
        } else {
            let message = last_diagnostic
                .unwrap_or_else(|| format!("exited with {}", process_utils::describe_exit(&status)));
            self.logger.log(LogLevel::Error, &message);
            Err(Error::process(&program, message))
        }
    }
}
