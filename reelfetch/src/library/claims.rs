//! In-flight claims on shared library folders.
//!
//! Show and season metadata are shared by every episode in the folder. When
//! an item fails, its batch must not remove metadata it wrote while another
//! item is still working in the same folder, or once any item in that folder
//! was committed. Items register a claim on their folders before touching
//! them and settle it on commit; the metadata undo consults both.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::batch::{self, Action, Undo};
use crate::utils::fs::io_error;
use crate::Result;

#[derive(Debug, Default)]
struct ClaimState {
    /// Items working below each folder.
    counts: HashMap<PathBuf, usize>,
    /// Folders holding at least one committed item.
    settled: HashSet<PathBuf>,
}

impl ClaimState {
    /// Whether metadata in `folder` is relied upon by anyone but the caller,
    /// who is expected to hold one claim on it.
    fn is_shared(&self, folder: &Path) -> bool {
        self.settled.contains(folder)
            || self.counts.get(folder).copied().unwrap_or(0) > 1
    }
}

/// Claims on library folders by in-flight and committed items.
#[derive(Debug, Default, Clone)]
pub struct FolderClaims {
    state: Arc<Mutex<ClaimState>>,
}

impl FolderClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `folders` until the returned guard is dropped.
    pub fn claim(&self, folders: &[&Path]) -> ClaimGuard {
        let mut state = self.state.lock();
        for folder in folders {
            *state.counts.entry(folder.to_path_buf()).or_default() += 1;
        }
        ClaimGuard {
            claims: self.clone(),
            folders: folders.iter().map(|f| f.to_path_buf()).collect(),
        }
    }

    pub fn count(&self, folder: &Path) -> usize {
        self.state.lock().counts.get(folder).copied().unwrap_or(0)
    }

    /// Whether a committed item lives below `folder`.
    pub fn is_settled(&self, folder: &Path) -> bool {
        self.state.lock().settled.contains(folder)
    }

    /// Write shared metadata at `path` unless present. The undo leaves the
    /// file alone while other items hold a claim on `folder` or once `folder`
    /// is settled.
    pub fn write_metadata<T: Serialize + ?Sized>(
        &self,
        folder: &Path,
        path: PathBuf,
        value: &T,
    ) -> Result<WriteSharedMetadata> {
        Ok(WriteSharedMetadata {
            inner: batch::write_json_if_absent(&path, value)?,
            folder: folder.to_path_buf(),
            path,
            claims: self.clone(),
        })
    }
}

/// Releases claims on drop.
#[derive(Debug)]
pub struct ClaimGuard {
    claims: FolderClaims,
    folders: Vec<PathBuf>,
}

impl ClaimGuard {
    /// Mark the claimed folders as holding committed content. Their shared
    /// metadata is no longer removed by any rollback.
    pub fn settle(&self) {
        let mut state = self.claims.state.lock();
        for folder in &self.folders {
            state.settled.insert(folder.clone());
        }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut state = self.claims.state.lock();
        for folder in &self.folders {
            if let Some(count) = state.counts.get_mut(folder) {
                *count -= 1;
                if *count == 0 {
                    state.counts.remove(folder);
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct WriteSharedMetadata {
    inner: batch::WriteFileIfAbsent,
    folder: PathBuf,
    path: PathBuf,
    claims: FolderClaims,
}

#[async_trait]
impl Action for WriteSharedMetadata {
    fn describe(&self) -> String {
        format!("write shared metadata {}", self.path.display())
    }

    async fn apply(self: Box<Self>) -> Result<Option<Box<dyn Undo>>> {
        let Self {
            inner,
            folder,
            path,
            claims,
        } = *self;
        let created = Box::new(inner).apply().await?.is_some();
        Ok(created.then(|| {
            Box::new(RemoveUnlessShared {
                folder,
                path,
                claims,
            }) as Box<dyn Undo>
        }))
    }
}

struct RemoveUnlessShared {
    folder: PathBuf,
    path: PathBuf,
    claims: FolderClaims,
}

#[async_trait]
impl Undo for RemoveUnlessShared {
    fn describe(&self) -> String {
        format!("remove {} unless shared", self.path.display())
    }

    async fn revert(self: Box<Self>) -> Result<()> {
        // Check and unlink under the lock so that a new claimant either sees
        // the file or writes its own.
        let state = self.claims.state.lock();
        if state.is_shared(&self.folder) {
            debug!(path = %self.path.display(), "metadata still in use, keeping");
            return Ok(());
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("removing file", &self.path, e)),
        }
    }
}
