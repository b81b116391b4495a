//! Transactional action log for file-system changes.
//!
//! A [`Batch`] executes [`Action`]s immediately and records the [`Undo`] step
//! each one hands back. When an action fails, everything logged so far is
//! reverted in strict reverse order before the error is returned, so callers
//! never clean up by hand.
//!
//! Actions only produce an undo step when they actually changed the file
//! system. Replaying the log therefore never touches anything that existed
//! before the batch started.

mod actions;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::Result;

pub use actions::{
    CreateDir, CreateDirAll, TrackFile, WriteFile, WriteFileIfAbsent, create_dir, create_dir_all,
    track_file, write_file, write_file_if_absent, write_json, write_json_if_absent,
};

/// A reversible effect.
#[async_trait]
pub trait Action: Send {
    /// Short description used in logs.
    fn describe(&self) -> String;

    /// Perform the effect.
    ///
    /// Returns the step that reverses it, or `None` when nothing changed. A
    /// failing action must leave the file system as it found it.
    async fn apply(self: Box<Self>) -> Result<Option<Box<dyn Undo>>>;
}

/// The reversing half of an [`Action`].
#[async_trait]
pub trait Undo: Send {
    fn describe(&self) -> String;

    async fn revert(self: Box<Self>) -> Result<()>;
}

struct LogEntry {
    action: String,
    undo: Option<Box<dyn Undo>>,
}

/// Ordered, append-only log of executed actions for one unit of work.
pub struct Batch {
    label: String,
    log: Vec<LogEntry>,
}

impl Batch {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            log: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of logged actions that are still reversible.
    pub fn pending_undo(&self) -> usize {
        self.log.iter().filter(|e| e.undo.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Execute `action` and log it.
    ///
    /// On failure the whole batch is rolled back and the triggering error is
    /// returned.
    pub async fn perform<A>(&mut self, action: A) -> Result<()>
    where
        A: Action + 'static,
    {
        let name = action.describe();
        match Box::new(action).apply().await {
            Ok(undo) => {
                trace!(batch = %self.label, action = %name, reversible = undo.is_some(), "action applied");
                self.log.push(LogEntry { action: name, undo });
                Ok(())
            }
            Err(e) => {
                warn!(batch = %self.label, action = %name, error = %e, "action failed, rolling back batch");
                self.rollback().await;
                Err(e)
            }
        }
    }

    /// Revert every logged action in reverse order.
    ///
    /// Safe to call repeatedly; an undo step that fails is logged and skipped
    /// so the remaining steps still run. Returns the number of steps reverted.
    pub async fn rollback(&mut self) -> usize {
        let mut reverted = 0;
        while let Some(entry) = self.log.pop() {
            let Some(undo) = entry.undo else {
                continue;
            };
            let what = undo.describe();
            match undo.revert().await {
                Ok(()) => {
                    reverted += 1;
                    trace!(batch = %self.label, undo = %what, "reverted");
                }
                Err(e) => {
                    warn!(
                        batch = %self.label,
                        action = %entry.action,
                        error = %e,
                        "failed to revert action"
                    );
                }
            }
        }
        if reverted > 0 {
            debug!(batch = %self.label, reverted, "batch rolled back");
        }
        reverted
    }

    /// Discard the log, keeping every change. Returns the number of actions kept.
    pub fn commit(mut self) -> usize {
        let kept = self.log.len();
        self.log.clear();
        debug!(batch = %self.label, actions = kept, "batch committed");
        kept
    }

    /// Turn this batch into an undo step that rolls the whole batch back.
    ///
    /// Returns `None` when nothing in the batch is reversible.
    pub fn into_undo(mut self) -> Option<Box<dyn Undo>> {
        if self.pending_undo() == 0 {
            self.log.clear();
            return None;
        }
        let log = std::mem::take(&mut self.log);
        Some(Box::new(NestedUndo {
            inner: Batch {
                label: std::mem::take(&mut self.label),
                log,
            },
        }))
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        let pending = self.pending_undo();
        if pending > 0 {
            warn!(
                batch = %self.label,
                pending,
                "batch dropped without commit or rollback; changes are kept"
            );
        }
    }
}

struct NestedUndo {
    inner: Batch,
}

#[async_trait]
impl Undo for NestedUndo {
    fn describe(&self) -> String {
        format!("rollback nested batch {}", self.inner.label)
    }

    async fn revert(self: Box<Self>) -> Result<()> {
        let NestedUndo { mut inner } = *self;
        inner.rollback().await;
        Ok(())
    }
}
