//! SQLite snapshot storage.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fleetsim_id::SnapshotVersion;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use super::{join_error, SnapshotStorage, StorageError};
use crate::snapshot::FleetSnapshot;

/// Keeps the newest `retain` snapshots in a `snapshots` table keyed by version.
///
/// Each write is one `IMMEDIATE` transaction that checks the newest stored
/// version, inserts, and trims old rows, so concurrent writers from
/// different processes cannot interleave.
pub struct SqliteSnapshotStorage {
    conn: Arc<Mutex<Connection>>,
    retain: usize,
    location: String,
}

impl SqliteSnapshotStorage {
    /// Open or create a snapshot database at the given path.
    pub fn open<P: AsRef<Path>>(path: P, retain: usize) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;

        Self::with_connection(conn, retain, format!("sqlite:{}", path.display()))
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory(retain: usize) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, retain, "sqlite::memory:".to_string())
    }

    fn with_connection(
        conn: Connection,
        retain: usize,
        location: String,
    ) -> Result<Self, StorageError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                version INTEGER PRIMARY KEY,
                taken_at TEXT NOT NULL,
                instance_count INTEGER NOT NULL,
                payload BLOB NOT NULL
            );
            "#,
        )?;
        debug!(location = %location, "Snapshot schema initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retain: retain.max(1),
            location,
        })
    }

    /// Versions currently stored, oldest first.
    pub async fn versions(&self) -> Result<Vec<SnapshotVersion>, StorageError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<Vec<SnapshotVersion>, StorageError> {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare("SELECT version FROM snapshots ORDER BY version")?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            let mut versions = Vec::new();
            for row in rows {
                versions.push(SnapshotVersion::new(row? as u64));
            }
            Ok(versions)
        })
        .await
        .map_err(join_error)?
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
    conn.lock()
        .map_err(|_| StorageError::Unavailable("snapshot database lock poisoned".to_string()))
}

fn to_sql_version(version: SnapshotVersion) -> Result<i64, StorageError> {
    i64::try_from(version.value())
        .map_err(|_| StorageError::Unavailable(format!("version {version} out of range")))
}

#[async_trait]
impl SnapshotStorage for SqliteSnapshotStorage {
    async fn read_latest(&self) -> Result<Option<FleetSnapshot>, StorageError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<Option<FleetSnapshot>, StorageError> {
            let conn = lock(&conn)?;
            let payload: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT payload FROM snapshots ORDER BY version DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;

            match payload {
                Some(bytes) => Ok(Some(FleetSnapshot::decode(&bytes)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(join_error)?
    }

    async fn write(&self, snapshot: &FleetSnapshot) -> Result<(), StorageError> {
        let conn = Arc::clone(&self.conn);
        let retain = self.retain as i64;
        let version = snapshot.version;
        let taken_at = snapshot.taken_at.to_rfc3339();
        let instance_count = snapshot.instance_count() as i64;
        let payload = snapshot.encode()?;

        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = lock(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let latest: Option<i64> =
                tx.query_row("SELECT MAX(version) FROM snapshots", [], |row| row.get(0))?;
            let sql_version = to_sql_version(version)?;
            if let Some(latest) = latest {
                if latest >= sql_version {
                    return Err(StorageError::StaleVersion {
                        attempted: version,
                        latest: SnapshotVersion::new(latest as u64),
                    });
                }
            }

            tx.execute(
                "INSERT INTO snapshots (version, taken_at, instance_count, payload) VALUES (?1, ?2, ?3, ?4)",
                params![sql_version, taken_at, instance_count, payload],
            )?;
            tx.execute(
                "DELETE FROM snapshots WHERE version NOT IN (SELECT version FROM snapshots ORDER BY version DESC LIMIT ?1)",
                params![retain],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    fn describe(&self) -> String {
        self.location.clone()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn snapshot(v: u64) -> FleetSnapshot {
        FleetSnapshot::new(SnapshotVersion::new(v), Vec::new())
    }

    #[tokio::test]
    async fn test_empty_database_reads_none() {
        let storage = SqliteSnapshotStorage::open_in_memory(3).unwrap();
        assert!(storage.read_latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_and_retention() {
        let storage = SqliteSnapshotStorage::open_in_memory(2).unwrap();
        for v in 1..=4 {
            storage.write(&snapshot(v)).await.unwrap();
        }

        let latest = storage.read_latest().await.unwrap().unwrap();
        assert_eq!(latest.version, SnapshotVersion::new(4));
        assert_eq!(
            storage.versions().await.unwrap(),
            vec![SnapshotVersion::new(3), SnapshotVersion::new(4)]
        );
    }

    #[tokio::test]
    async fn test_stale_version_rejected() {
        let storage = SqliteSnapshotStorage::open_in_memory(5).unwrap();
        storage.write(&snapshot(5)).await.unwrap();

        let err = storage.write(&snapshot(5)).await.unwrap_err();
        assert!(matches!(err, StorageError::StaleVersion { .. }));
        let err = storage.write(&snapshot(4)).await.unwrap_err();
        assert!(matches!(err, StorageError::StaleVersion { .. }));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshots.db");

        {
            let storage = SqliteSnapshotStorage::open(&path, 3).unwrap();
            storage.write(&snapshot(7)).await.unwrap();
        }

        let storage = SqliteSnapshotStorage::open(&path, 3).unwrap();
        let latest = storage.read_latest().await.unwrap().unwrap();
        assert_eq!(latest.version, SnapshotVersion::new(7));
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_reported() {
        let storage = SqliteSnapshotStorage::open_in_memory(3).unwrap();
        {
            let conn = storage.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO snapshots (version, taken_at, instance_count, payload) VALUES (1, 'now', 0, x'00ff')",
                [],
            )
            .unwrap();
        }
        let err = storage.read_latest().await.unwrap_err();
        assert!(err.is_corrupt());
    }
}
