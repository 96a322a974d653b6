//! Startup restore.
//!
//! Rebuilds the [`FleetStore`] from the newest durable snapshot before any
//! writer is released. A missing snapshot is a cold start; anything that
//! cannot be read or applied in full is fatal and leaves the store as it
//! was.
//!
//! A snapshot taken mid-launch or mid-terminate holds `Pending` or
//! `Terminating` instances. Whatever was driving them died with the writer,
//! so they are settled to `Terminated` on the way in.

use fleetsim_events::{
    ActorType, FleetEventPayload, FleetRestoredPayload, InstanceStatus,
    InstanceStatusChangedPayload,
};
use fleetsim_id::SnapshotVersion;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::events::EventRecorder;
use crate::snapshot::FleetSnapshot;
use crate::storage::{SnapshotStorage, StorageError};
use crate::store::{FleetStore, StoreError};

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("failed to read snapshot from {location}: {source}")]
    Storage {
        location: String,
        #[source]
        source: StorageError,
    },

    #[error("snapshot {version} cannot be applied: {source}")]
    Invalid {
        version: SnapshotVersion,
        #[source]
        source: StoreError,
    },
}

/// What a restore did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Restored snapshot version; `None` on cold start.
    pub version: Option<SnapshotVersion>,
    pub instance_count: usize,
    /// Instances found mid-launch or mid-terminate and settled.
    pub settled: usize,
}

impl RestoreReport {
    pub fn cold_start() -> Self {
        Self {
            version: None,
            instance_count: 0,
            settled: 0,
        }
    }

    pub fn is_cold_start(&self) -> bool {
        self.version.is_none()
    }
}

/// Populate `store` from the newest snapshot in `storage`.
///
/// Restoring the same snapshot twice yields the same store.
#[instrument(skip_all, fields(storage = %storage.describe()))]
pub async fn restore(
    storage: &dyn SnapshotStorage,
    store: &FleetStore,
    events: &EventRecorder,
) -> Result<RestoreReport, RestoreError> {
    let Some(snapshot) = read_latest(storage).await? else {
        info!("No snapshot found, starting with an empty fleet");
        return Ok(RestoreReport::cold_start());
    };
    apply(snapshot, store, events).await
}

/// Apply a snapshot newer than `known`, if storage has one.
///
/// Run on promotion: another replica may have led and written snapshots
/// since this process restored at startup.
#[instrument(skip_all, fields(storage = %storage.describe(), known = ?known))]
pub async fn catch_up(
    storage: &dyn SnapshotStorage,
    store: &FleetStore,
    events: &EventRecorder,
    known: Option<SnapshotVersion>,
) -> Result<Option<RestoreReport>, RestoreError> {
    let Some(snapshot) = read_latest(storage).await? else {
        return Ok(None);
    };
    if known.is_some_and(|k| snapshot.version <= k) {
        return Ok(None);
    }
    apply(snapshot, store, events).await.map(Some)
}

async fn read_latest(storage: &dyn SnapshotStorage) -> Result<Option<FleetSnapshot>, RestoreError> {
    storage
        .read_latest()
        .await
        .map_err(|source| RestoreError::Storage {
            location: storage.describe(),
            source,
        })
}

async fn apply(
    snapshot: FleetSnapshot,
    store: &FleetStore,
    events: &EventRecorder,
) -> Result<RestoreReport, RestoreError> {
    let version = snapshot.version;
    let instance_count = snapshot.instance_count();
    let taken_at = snapshot.taken_at;

    let mut instances = snapshot.instances;
    let settled: Vec<_> = instances
        .iter_mut()
        .filter_map(|inst| {
            inst.settle(taken_at)
                .map(|from| (inst.id, from, inst.termination_cause))
        })
        .collect();

    store
        .replace_all(instances)
        .await
        .map_err(|source| RestoreError::Invalid { version, source })?;

    for (id, from, cause) in &settled {
        events.record(
            id.to_string(),
            ActorType::System,
            FleetEventPayload::InstanceStatusChanged(InstanceStatusChangedPayload {
                from: *from,
                to: InstanceStatus::Terminated,
                cause: *cause,
            }),
        );
    }
    if !settled.is_empty() {
        warn!(%version, settled = settled.len(), "Settled instances caught mid-transition");
    }

    events.record(
        "fleet",
        ActorType::System,
        FleetEventPayload::FleetRestored(FleetRestoredPayload {
            version: Some(version),
            instance_count,
        }),
    );
    info!(%version, instance_count, "Fleet restored from snapshot");

    Ok(RestoreReport {
        version: Some(version),
        instance_count,
        settled: settled.len(),
    })
}
