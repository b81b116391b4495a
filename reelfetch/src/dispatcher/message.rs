use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity of a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Info,
    Success,
    Warning,
    Error,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageStatus::Info => write!(f, "info"),
            MessageStatus::Success => write!(f, "success"),
            MessageStatus::Warning => write!(f, "warning"),
            MessageStatus::Error => write!(f, "error"),
        }
    }
}

/// Progress payload carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
}

impl Progress {
    pub fn new(current: u64, total: u64) -> Self {
        Self { current, total }
    }

    /// Completion ratio in percent, clamped to `0..=100`.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.current as f64 / self.total as f64 * 100.0).clamp(0.0, 100.0)
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.current >= self.total
    }
}

/// A status or progress notification.
///
/// Republishing a message with the same `id` updates it in place for
/// consumers. Pinned messages must not be auto-dismissed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub status: MessageStatus,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default)]
    pub pinned: bool,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(status: MessageStatus, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status,
            text: text.into(),
            progress: None,
            pinned: false,
            updated_at: Utc::now(),
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(MessageStatus::Info, text)
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self::new(MessageStatus::Success, text)
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::new(MessageStatus::Warning, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(MessageStatus::Error, text)
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    pub fn with_progress(mut self, current: u64, total: u64) -> Self {
        self.progress = Some(Progress::new(current, total));
        self
    }

    /// Mark this message as updated now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
