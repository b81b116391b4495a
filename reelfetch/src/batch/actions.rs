//! Built-in file-system actions.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{Action, Batch, Undo};
use crate::utils::fs::{io_error, remove_dir_if_empty, remove_file_if_exists};
use crate::{Error, Result};

/// Create a single directory. No-op when it already exists.
pub fn create_dir(path: impl AsRef<Path>) -> CreateDir {
    CreateDir {
        path: path.as_ref().to_path_buf(),
    }
}

/// Create a directory and any missing ancestors.
pub fn create_dir_all(path: impl AsRef<Path>) -> CreateDirAll {
    CreateDirAll {
        path: path.as_ref().to_path_buf(),
    }
}

/// Write a file, replacing any previous content.
pub fn write_file(path: impl AsRef<Path>, contents: Vec<u8>) -> WriteFile {
    WriteFile {
        path: path.as_ref().to_path_buf(),
        contents,
    }
}

/// Write a file only if nobody wrote it before.
pub fn write_file_if_absent(path: impl AsRef<Path>, contents: Vec<u8>) -> WriteFileIfAbsent {
    WriteFileIfAbsent {
        path: path.as_ref().to_path_buf(),
        contents,
    }
}

/// Serialize `value` as pretty JSON and write it.
pub fn write_json<T: Serialize + ?Sized>(path: impl AsRef<Path>, value: &T) -> Result<WriteFile> {
    Ok(write_file(path, serde_json::to_vec_pretty(value)?))
}

/// Serialize `value` as pretty JSON and write it unless the file exists.
pub fn write_json_if_absent<T: Serialize + ?Sized>(
    path: impl AsRef<Path>,
    value: &T,
) -> Result<WriteFileIfAbsent> {
    Ok(write_file_if_absent(path, serde_json::to_vec_pretty(value)?))
}

/// Register a file that a later step is going to produce.
pub fn track_file(path: impl AsRef<Path>) -> TrackFile {
    TrackFile {
        path: path.as_ref().to_path_buf(),
    }
}

#[derive(Debug)]
pub struct CreateDir {
    path: PathBuf,
}

#[async_trait]
impl Action for CreateDir {
    fn describe(&self) -> String {
        format!("create directory {}", self.path.display())
    }

    async fn apply(self: Box<Self>) -> Result<Option<Box<dyn Undo>>> {
        match tokio::fs::create_dir(&self.path).await {
            Ok(()) => Ok(Some(Box::new(RemoveDir { path: self.path }))),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let meta = tokio::fs::metadata(&self.path)
                    .await
                    .map_err(|e| io_error("inspecting", &self.path, e))?;
                if meta.is_dir() {
                    Ok(None)
                } else {
                    Err(Error::io_path(
                        "creating directory",
                        &self.path,
                        std::io::Error::new(ErrorKind::AlreadyExists, "a file is in the way"),
                    ))
                }
            }
            Err(e) => Err(io_error("creating directory", &self.path, e)),
        }
    }
}

#[derive(Debug)]
pub struct CreateDirAll {
    path: PathBuf,
}

#[async_trait]
impl Action for CreateDirAll {
    fn describe(&self) -> String {
        format!("create directory tree {}", self.path.display())
    }

    async fn apply(self: Box<Self>) -> Result<Option<Box<dyn Undo>>> {
        // Collect the missing levels, deepest first.
        let mut missing = Vec::new();
        let mut cursor = Some(self.path.as_path());
        while let Some(dir) = cursor {
            if dir.as_os_str().is_empty() {
                break;
            }
            let exists = tokio::fs::try_exists(dir)
                .await
                .map_err(|e| io_error("checking", dir, e))?;
            if exists {
                break;
            }
            missing.push(dir.to_path_buf());
            cursor = dir.parent();
        }

        if missing.is_empty() {
            return Ok(None);
        }

        let mut nested = Batch::new(format!("mkdir -p {}", self.path.display()));
        for dir in missing.into_iter().rev() {
            // A failure here rolls the nested batch back on its own.
            nested.perform(create_dir(dir)).await?;
        }
        Ok(nested.into_undo())
    }
}

#[derive(Debug)]
pub struct WriteFile {
    path: PathBuf,
    contents: Vec<u8>,
}

#[async_trait]
impl Action for WriteFile {
    fn describe(&self) -> String {
        format!("write {}", self.path.display())
    }

    async fn apply(self: Box<Self>) -> Result<Option<Box<dyn Undo>>> {
        let previous = match tokio::fs::read(&self.path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(io_error("reading", &self.path, e)),
        };

        if let Err(e) = tokio::fs::write(&self.path, &self.contents).await {
            let undo = RestoreFile {
                path: self.path.clone(),
                previous,
            };
            // Leave no half-written file behind.
            let _ = Box::new(undo).revert().await;
            return Err(io_error("writing", &self.path, e));
        }

        Ok(Some(Box::new(RestoreFile {
            path: self.path,
            previous,
        })))
    }
}

#[derive(Debug)]
pub struct WriteFileIfAbsent {
    path: PathBuf,
    contents: Vec<u8>,
}

#[async_trait]
impl Action for WriteFileIfAbsent {
    fn describe(&self) -> String {
        format!("write {} unless present", self.path.display())
    }

    async fn apply(self: Box<Self>) -> Result<Option<Box<dyn Undo>>> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await;
        let mut file = match file {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %self.path.display(), "keeping existing file");
                return Ok(None);
            }
            Err(e) => return Err(io_error("creating", &self.path, e)),
        };

        let written = async {
            file.write_all(&self.contents).await?;
            file.flush().await
        }
        .await;
        drop(file);

        if let Err(e) = written {
            let _ = remove_file_if_exists(&self.path).await;
            return Err(io_error("writing", &self.path, e));
        }

        Ok(Some(Box::new(RemoveFile { path: self.path })))
    }
}

#[derive(Debug)]
pub struct TrackFile {
    path: PathBuf,
}

#[async_trait]
impl Action for TrackFile {
    fn describe(&self) -> String {
        format!("track output {}", self.path.display())
    }

    async fn apply(self: Box<Self>) -> Result<Option<Box<dyn Undo>>> {
        let exists = tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| io_error("checking", &self.path, e))?;
        if exists {
            return Err(Error::validation(format!(
                "refusing to overwrite existing file {}",
                self.path.display()
            )));
        }
        Ok(Some(Box::new(RemoveFile { path: self.path })))
    }
}

struct RemoveDir {
    path: PathBuf,
}

#[async_trait]
impl Undo for RemoveDir {
    fn describe(&self) -> String {
        format!("remove directory {}", self.path.display())
    }

    async fn revert(self: Box<Self>) -> Result<()> {
        remove_dir_if_empty(&self.path).await.map(|_| ())
    }
}

struct RemoveFile {
    path: PathBuf,
}

#[async_trait]
impl Undo for RemoveFile {
    fn describe(&self) -> String {
        format!("remove {}", self.path.display())
    }

    async fn revert(self: Box<Self>) -> Result<()> {
        remove_file_if_exists(&self.path).await.map(|_| ())
    }
}

struct RestoreFile {
    path: PathBuf,
    previous: Option<Vec<u8>>,
}

#[async_trait]
impl Undo for RestoreFile {
    fn describe(&self) -> String {
        match self.previous {
            Some(_) => format!("restore {}", self.path.display()),
            None => format!("remove {}", self.path.display()),
        }
    }

    async fn revert(self: Box<Self>) -> Result<()> {
        match self.previous {
            Some(bytes) => tokio::fs::write(&self.path, bytes)
                .await
                .map_err(|e| io_error("restoring", &self.path, e)),
            None => remove_file_if_exists(&self.path).await.map(|_| ()),
        }
    }
}
