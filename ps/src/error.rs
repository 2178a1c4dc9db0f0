//! Errors from snapshot operations

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("No progress snapshot at {0}")]
    SnapshotMissing(PathBuf),

    #[error("Snapshot at {path} is unreadable: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProgressError {
    /// True when the error only means "nothing was persisted"
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::SnapshotMissing(_))
    }
}
