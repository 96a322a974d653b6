//! Durable snapshot storage.
//!
//! Backends persist [`FleetSnapshot`]s atomically and are version-addressed:
//! a write whose version is not strictly greater than the newest stored
//! snapshot is rejected with [`StorageError::StaleVersion`]. That keeps
//! snapshots in total order even if a deposed leader is still flushing.
//!
//! - `file`: one JSON document replaced via temp file + fsync + rename
//! - `sqlite`: one row per version inside a transaction, newest N retained
//! - `memory`: process-local, for tests and throwaway runs

mod file;
mod memory;
mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fleetsim_id::SnapshotVersion;
use thiserror::Error;

use crate::snapshot::{FleetSnapshot, SnapshotError};

pub use file::FileSnapshotStorage;
pub use memory::MemorySnapshotStorage;
pub use sqlite::SqliteSnapshotStorage;

/// Errors from snapshot storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored snapshot is unreadable: {0}")]
    Corrupt(#[from] SnapshotError),

    #[error("snapshot version {attempted} is not newer than stored version {latest}")]
    StaleVersion {
        attempted: SnapshotVersion,
        latest: SnapshotVersion,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// True if the stored data itself is bad, as opposed to the medium
    /// being temporarily unreachable.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, StorageError::Corrupt(_))
    }
}

/// Durable storage for fleet snapshots.
#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    /// Read the newest snapshot, or `None` if nothing was ever written.
    async fn read_latest(&self) -> Result<Option<FleetSnapshot>, StorageError>;

    /// Atomically persist a snapshot.
    ///
    /// After an error the previously stored snapshot is still the latest
    /// readable one.
    async fn write(&self, snapshot: &FleetSnapshot) -> Result<(), StorageError>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

/// Storage backend selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    File { dir: PathBuf },
    Sqlite { path: PathBuf, retain: usize },
    Memory,
}

impl StorageBackend {
    /// Open the configured backend.
    pub fn open(&self) -> Result<Arc<dyn SnapshotStorage>, StorageError> {
        Ok(match self {
            StorageBackend::File { dir } => Arc::new(FileSnapshotStorage::new(dir.clone())),
            StorageBackend::Sqlite { path, retain } => {
                Arc::new(SqliteSnapshotStorage::open(path, *retain)?)
            }
            StorageBackend::Memory => Arc::new(MemorySnapshotStorage::new()),
        })
    }
}

fn join_error(err: tokio::task::JoinError) -> StorageError {
    StorageError::Unavailable(format!("storage task failed: {err}"))
}
