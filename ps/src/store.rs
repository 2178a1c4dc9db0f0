//! Snapshot file storage

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ProgressError;

/// Size and entry count of a snapshot, without interpreting the entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSummary {
    /// Number of top-level entries (queued tasks)
    pub entries: usize,
    /// File size in bytes
    pub bytes: u64,
}

/// Removes a half-written temporary file unless disarmed
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!(path = ?self.path, "TempFileGuard::drop: removing partial snapshot");
            if let Err(e) = std::fs::remove_file(&self.path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = ?self.path, error = %e, "Failed to remove partial snapshot");
            }
        }
    }
}

/// Durable store for a single progress snapshot
///
/// One snapshot file holds the whole queue. Writes replace it atomically;
/// [`ProgressStore::load_and_clear`] consumes it.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    /// Create a store backed by the given snapshot file path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        debug!(?path, "ProgressStore::new: called");
        Self { path }
    }

    /// Path of the snapshot file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check whether a snapshot is waiting to be consumed
    pub async fn exists(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Persist the full queue, replacing any previous snapshot
    pub async fn save<T: Serialize>(&self, tasks: &[T]) -> Result<(), ProgressError> {
        debug!(path = ?self.path, count = tasks.len(), "ProgressStore::save: called");
        let content = serde_json::to_string_pretty(tasks)? + "\n";

        let parent = self.parent_dir();
        debug!(?parent, "ProgressStore::save: ensuring directory");
        fs::create_dir_all(parent).await?;

        let tmp_path = self.temp_path();
        let guard = TempFileGuard::new(tmp_path.clone());

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &self.path).await?;
        guard.disarm();
        self.sync_parent_dir().await?;

        info!(path = ?self.path, count = tasks.len(), "Saved progress snapshot");
        Ok(())
    }

    /// Load the snapshot and delete it, so it is consumed exactly once
    pub async fn load_and_clear<T: DeserializeOwned>(&self) -> Result<Vec<T>, ProgressError> {
        debug!(path = ?self.path, "ProgressStore::load_and_clear: called");
        let tasks = self.peek().await?;

        fs::remove_file(&self.path).await?;
        self.sync_parent_dir().await?;
        info!(path = ?self.path, count = tasks.len(), "Consumed progress snapshot");
        Ok(tasks)
    }

    /// Load the snapshot without consuming it
    pub async fn peek<T: DeserializeOwned>(&self) -> Result<Vec<T>, ProgressError> {
        debug!(path = ?self.path, "ProgressStore::peek: called");
        let content = self.read().await?;
        serde_json::from_str(&content).map_err(|source| ProgressError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Describe the snapshot without knowing its task type
    pub async fn summary(&self) -> Result<SnapshotSummary, ProgressError> {
        debug!(path = ?self.path, "ProgressStore::summary: called");
        let entries: Vec<serde_json::Value> = self.peek().await?;
        let bytes = fs::metadata(&self.path).await?.len();
        Ok(SnapshotSummary {
            entries: entries.len(),
            bytes,
        })
    }

    /// Delete the snapshot if present, returning whether one was removed
    pub async fn discard(&self) -> Result<bool, ProgressError> {
        debug!(path = ?self.path, "ProgressStore::discard: called");
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                self.sync_parent_dir().await?;
                info!(path = ?self.path, "Discarded progress snapshot");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("ProgressStore::discard: nothing to discard");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self) -> Result<String, ProgressError> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.path, "ProgressStore::read: snapshot missing");
                Err(ProgressError::SnapshotMissing(self.path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Flush the directory entry so a rename or removal survives a crash
    #[cfg(unix)]
    async fn sync_parent_dir(&self) -> Result<(), ProgressError> {
        let dir = fs::File::open(self.parent_dir()).await?;
        dir.sync_all().await?;
        Ok(())
    }

    // Opening a directory as a file is unix-only
    #[cfg(not(unix))]
    async fn sync_parent_dir(&self) -> Result<(), ProgressError> {
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| crate::DEFAULT_SNAPSHOT_FILE.to_string());
        self.path.with_file_name(format!(".{}.{}.tmp", name, Uuid::now_v7()))
    }
}
