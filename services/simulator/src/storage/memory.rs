//! In-memory snapshot storage.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fleetsim_id::SnapshotVersion;

use super::{SnapshotStorage, StorageError};
use crate::snapshot::FleetSnapshot;

#[derive(Default)]
struct MemoryState {
    /// Encoded snapshots, oldest first.
    stored: Vec<(SnapshotVersion, Vec<u8>)>,
    fail_writes: u32,
    write_delay: Option<Duration>,
}

/// Process-local storage that keeps every written snapshot.
///
/// Snapshots are stored encoded so reads go through the same decode and
/// checksum path as the durable backends. Writes can be made to fail or
/// stall, which is how tests exercise the backup retry and cancellation
/// paths.
#[derive(Default)]
pub struct MemorySnapshotStorage {
    state: Mutex<MemoryState>,
}

impl MemorySnapshotStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with `Unavailable`.
    pub fn fail_next_writes(&self, count: u32) {
        self.with_state(|s| s.fail_writes = count);
    }

    /// Delay every write by `delay` before it commits.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.with_state(|s| s.write_delay = delay);
    }

    /// Versions of all committed snapshots, oldest first.
    pub fn versions(&self) -> Vec<SnapshotVersion> {
        self.with_state(|s| s.stored.iter().map(|(v, _)| *v).collect())
    }

    /// Replace the newest snapshot's bytes.
    pub fn overwrite_latest(&self, bytes: Vec<u8>) {
        self.with_state(|s| match s.stored.last_mut() {
            Some(last) => last.1 = bytes,
            None => s.stored.push((SnapshotVersion::new(1), bytes)),
        });
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

#[async_trait]
impl SnapshotStorage for MemorySnapshotStorage {
    async fn read_latest(&self) -> Result<Option<FleetSnapshot>, StorageError> {
        let latest = self.with_state(|s| s.stored.last().map(|(_, bytes)| bytes.clone()));
        match latest {
            Some(bytes) => Ok(Some(FleetSnapshot::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, snapshot: &FleetSnapshot) -> Result<(), StorageError> {
        let delay = self.with_state(|s| s.write_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let bytes = snapshot.encode()?;
        self.with_state(|s| {
            if s.fail_writes > 0 {
                s.fail_writes -= 1;
                return Err(StorageError::Unavailable(
                    "injected write failure".to_string(),
                ));
            }
            if let Some((latest, _)) = s.stored.last() {
                if *latest >= snapshot.version {
                    return Err(StorageError::StaleVersion {
                        attempted: snapshot.version,
                        latest: *latest,
                    });
                }
            }
            s.stored.push((snapshot.version, bytes));
            Ok(())
        })
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
