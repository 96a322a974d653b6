//! Single-file snapshot storage.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{join_error, SnapshotStorage, StorageError};
use crate::snapshot::FleetSnapshot;

const SNAPSHOT_FILE: &str = "fleet-snapshot.json";

/// Stores the latest snapshot as `<dir>/fleet-snapshot.json`.
///
/// Writes go to a version-named temp file in the same directory which is
/// fsynced and then renamed over the live file, so readers only ever see
/// a complete previous or complete new snapshot.
///
/// The version check and the rename run under one lock taken on the
/// blocking thread, so a write whose caller already gave up still cannot
/// interleave with the next one.
pub struct FileSnapshotStorage {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileSnapshotStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Path of the live snapshot file.
    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }
}

fn read_snapshot(path: &Path) -> Result<Option<FleetSnapshot>, StorageError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(FleetSnapshot::decode(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_snapshot(dir: &Path, snapshot: &FleetSnapshot) -> Result<(), StorageError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(SNAPSHOT_FILE);

    match read_snapshot(&path) {
        Ok(Some(current)) if current.version >= snapshot.version => {
            return Err(StorageError::StaleVersion {
                attempted: snapshot.version,
                latest: current.version,
            });
        }
        Ok(_) => {}
        Err(StorageError::Corrupt(e)) => {
            warn!(path = %path.display(), error = %e, "Replacing unreadable snapshot file");
        }
        Err(e) => return Err(e),
    }

    let bytes = snapshot.encode()?;
    let temp_path = dir.join(format!("{SNAPSHOT_FILE}.{}.tmp", snapshot.version));

    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &path)?;

        // Persist the rename itself.
        if let Ok(dir_handle) = fs::File::open(dir) {
            let _ = dir_handle.sync_all();
        }
        Ok::<_, std::io::Error>(())
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }

    debug!(
        path = %path.display(),
        version = %snapshot.version,
        bytes = bytes.len(),
        "Snapshot file replaced"
    );
    Ok(())
}

#[async_trait]
impl SnapshotStorage for FileSnapshotStorage {
    async fn read_latest(&self) -> Result<Option<FleetSnapshot>, StorageError> {
        let path = self.snapshot_path();
        tokio::task::spawn_blocking(move || read_snapshot(&path))
            .await
            .map_err(join_error)?
    }

    async fn write(&self, snapshot: &FleetSnapshot) -> Result<(), StorageError> {
        let lock = Arc::clone(&self.write_lock);
        let dir = self.dir.clone();
        let snapshot = snapshot.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = match lock.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            write_snapshot(&dir, &snapshot)
        })
        .await
        .map_err(join_error)?
    }

    fn describe(&self) -> String {
        format!("file:{}", self.snapshot_path().display())
    }
}
