//! FFmpeg stderr parsing.
//!
//! FFmpeg reports progress as free-form text on stderr. The startup banner
//! carries the input duration (`Duration: 00:42:10.52, start: ...`) and the
//! periodic status line carries the processed size and media time
//! (`frame=... size=  1024kB time=00:00:04.00 bitrate=... speed=...`).

/// Parse time string in HH:MM:SS.ms format to seconds.
///
/// # Examples
/// ```ignore
/// assert_eq!(parse_time("00:00:10.50"), Some(10.5));
/// assert_eq!(parse_time("01:30:00.00"), Some(5400.0));
/// assert_eq!(parse_time("invalid"), None);
/// ```
pub fn parse_time(time_str: &str) -> Option<f64> {
    let mut parts = time_str.trim().split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || hours < 0.0 || minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Parse the `size=` field in bytes. Accepts `kB`, `KiB` and `mB`/`MiB` units.
pub fn parse_size(line: &str) -> Option<u64> {
    let start = line.find("size=")?;
    let rest = line[start + 5..].trim_start();
    let end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
    let value: f64 = rest[..end].parse().ok()?;
    let multiplier = match rest[end..].chars().next()? {
        'k' | 'K' => 1024.0,
        'm' | 'M' => 1024.0 * 1024.0,
        'g' | 'G' => 1024.0 * 1024.0 * 1024.0,
        'B' => 1.0,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}

/// Parse the `time=` field in seconds. `time=N/A` yields `None`.
pub fn parse_time_field(line: &str) -> Option<f64> {
    let start = line.find("time=")?;
    let rest = line[start + 5..].trim_start();
    let end = rest.find(' ').unwrap_or(rest.len());
    parse_time(&rest[..end])
}

/// Parse the `speed=` multiplier (e.g. `speed=1.00x`).
pub fn parse_speed(line: &str) -> Option<f64> {
    let start = line.find("speed=")?;
    let rest = line[start + 6..].trim_start();
    let end = rest.find('x')?;
    rest[..end].trim().parse().ok()
}

/// Parse the total input duration from the banner line.
pub fn parse_duration_banner(line: &str) -> Option<f64> {
    let rest = line.trim_start().strip_prefix("Duration:")?;
    let end = rest.find(',').unwrap_or(rest.len());
    parse_time(&rest[..end])
}

/// Whether the line is a periodic status line.
///
/// Require `time=` plus at least one other known marker so that unrelated
/// lines mentioning "time=" are not mistaken for progress.
pub fn is_progress_line(line: &str) -> bool {
    line.contains("time=") && (line.contains("frame=") || line.contains("size="))
}

/// Classification of one stderr record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputLine {
    /// Banner line carrying the total media duration in seconds.
    Duration(f64),
    /// Status line; carries the current estimate when one is available.
    Progress(Option<Estimate>),
    /// Anything else: kept as the last diagnostic for error reporting.
    Diagnostic,
}

/// Processed bytes and the projected final size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    pub current: u64,
    pub total: u64,
}

/// Incremental progress state for one ffmpeg run.
#[derive(Debug, Default, Clone)]
pub struct ProgressTracker {
    total_secs: Option<f64>,
    processed_bytes: u64,
    processed_secs: f64,
    speed: Option<f64>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stderr record.
    pub fn feed(&mut self, line: &str) -> OutputLine {
        if self.total_secs.is_none()
            && let Some(duration) = parse_duration_banner(line)
        {
            if duration > 0.0 {
                self.total_secs = Some(duration);
            }
            return OutputLine::Duration(duration);
        }

        if !is_progress_line(line) {
            return OutputLine::Diagnostic;
        }

        if let Some(bytes) = parse_size(line) {
            self.processed_bytes = self.processed_bytes.max(bytes);
        }
        if let Some(secs) = parse_time_field(line) {
            self.processed_secs = self.processed_secs.max(secs);
        }
        if let Some(speed) = parse_speed(line) {
            self.speed = Some(speed);
        }
        OutputLine::Progress(self.estimate())
    }

    /// Current position and projected final size, once the total duration is
    /// known and some media time was processed.
    pub fn estimate(&self) -> Option<Estimate> {
        let total_secs = self.total_secs?;
        if self.processed_secs <= 0.0 || self.processed_bytes == 0 {
            return None;
        }
        if self.processed_secs >= total_secs {
            return Some(Estimate {
                current: self.processed_bytes,
                total: self.processed_bytes,
            });
        }
        let projected = (self.processed_bytes as f64 * total_secs / self.processed_secs) as u64;
        Some(Estimate {
            current: self.processed_bytes,
            total: projected.max(self.processed_bytes),
        })
    }

    pub fn processed_bytes(&self) -> u64 {
        self.processed_bytes
    }

    pub fn processed_secs(&self) -> f64 {
        self.processed_secs
    }

    pub fn speed(&self) -> Option<f64> {
        self.speed
    }
}
