//! ProgressStore - consume-once progress snapshots
//!
//! Persists the pending portion of an in-memory task queue so a restarted
//! process can pick up where the previous one stopped.
//!
//! # Lifecycle
//!
//! ```text
//! shutdown ──save(queue)──▶ progress.json ──load_and_clear()──▶ startup
//!                                  │
//!                                  └── deleted on load (exactly-once)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use progressstore::ProgressStore;
//!
//! let store = ProgressStore::new("/var/lib/schedsync/progress.json");
//! store.save(&pending).await?;
//! let restored: Vec<Task> = store.load_and_clear().await?;
//! ```

pub mod cli;
pub mod config;
mod error;
mod store;

pub use error::ProgressError;
pub use store::{ProgressStore, SnapshotSummary};

/// Default snapshot file name
pub const DEFAULT_SNAPSHOT_FILE: &str = "progress.json";
