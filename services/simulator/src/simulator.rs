//! Process wiring.
//!
//! Order of events for one replica:
//!
//! 1. [`Simulator::bootstrap`] restores the store from durable storage. A
//!    failure here is fatal and nothing else starts.
//! 2. [`Simulator::start`] runs the elector against a private gate and
//!    spawns the workers against the public one.
//! 3. When the elector reports leadership, the promotion task applies any
//!    snapshot written by a previous leader since step 1, then opens the
//!    public gate. Workers and provider mutations are released only now.
//! 4. Loss of the private gate closes the public one, as does the backup
//!    worker finding a newer writer's snapshot. Workers stop and the
//!    process is expected to exit and come back as a follower.

use std::sync::Arc;
use std::time::Duration;

use fleetsim_id::ReplicaId;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backup::{BackupConfig, BackupWorker};
use crate::chaos::{ChaosConfig, ChaosWorker};
use crate::cluster::ClusterState;
use crate::config::Config;
use crate::election::{ElectionError, Elector};
use crate::events::{EventRecorder, DEFAULT_HISTORY_CAPACITY};
use crate::janitor::{JanitorConfig, JanitorWorker};
use crate::leadership::{self, LeadershipGate, LeadershipHandle};
use crate::provider::SimulatedProvider;
use crate::restore::{self, RestoreError, RestoreReport};
use crate::runtime::InstanceRuntime;
use crate::storage::SnapshotStorage;
use crate::store::FleetStore;
use crate::worker::{shutdown_requested, WorkerSet};

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("restore failed: {0}")]
    Restore(#[from] RestoreError),

    #[error("election failed: {0}")]
    Election(#[from] ElectionError),

    #[error("{0} task failed: {1}")]
    Task(&'static str, String),
}

/// Settings for the core simulator.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub replica_id: ReplicaId,
    pub backup: BackupConfig,
    pub chaos: ChaosConfig,
    pub janitor: JanitorConfig,
    pub max_instances: Option<usize>,
    pub event_history: usize,
    /// How long each task gets to stop on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            replica_id: ReplicaId::new(),
            backup: BackupConfig::default(),
            chaos: ChaosConfig::default(),
            janitor: JanitorConfig::default(),
            max_instances: None,
            event_history: DEFAULT_HISTORY_CAPACITY,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for SimulatorConfig {
    fn from(config: &Config) -> Self {
        Self {
            replica_id: config.replica_id,
            backup: config.backup.clone(),
            chaos: config.chaos.clone(),
            janitor: config.janitor.clone(),
            max_instances: config.max_instances,
            ..Default::default()
        }
    }
}

/// A restored simulator, ready to campaign for leadership.
pub struct Simulator {
    config: SimulatorConfig,
    store: FleetStore,
    storage: Arc<dyn SnapshotStorage>,
    events: Arc<EventRecorder>,
    provider: SimulatedProvider,
    cluster: Arc<ClusterState>,
    backup: Arc<BackupWorker>,
    leadership: Arc<LeadershipHandle>,
    gate: LeadershipGate,
    restored: RestoreReport,
}

impl Simulator {
    /// Restore state and assemble the components. No task is started.
    pub async fn bootstrap(
        config: SimulatorConfig,
        storage: Arc<dyn SnapshotStorage>,
        runtime: Arc<dyn InstanceRuntime>,
    ) -> Result<Self, RestoreError> {
        let store = FleetStore::new();
        let events = Arc::new(EventRecorder::new(
            Some(config.replica_id),
            config.event_history,
        ));

        let restored = restore::restore(storage.as_ref(), &store, &events).await?;
        info!(
            replica_id = %config.replica_id,
            version = ?restored.version,
            instances = restored.instance_count,
            "Startup restore complete"
        );

        let (leadership, gate) = leadership::channel();
        let provider = SimulatedProvider::new(store.clone(), gate.clone(), Arc::clone(&events))
            .with_runtime(runtime)
            .with_max_instances(config.max_instances);
        let cluster = Arc::new(ClusterState::new(provider.clone()));
        let backup = Arc::new(BackupWorker::new(
            store.clone(),
            Arc::clone(&storage),
            Arc::clone(&events),
            config.backup.clone(),
            restored.version,
        ));

        Ok(Self {
            config,
            store,
            storage,
            events,
            provider,
            cluster,
            backup,
            leadership: Arc::new(leadership),
            gate,
            restored,
        })
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.config.replica_id
    }

    pub fn store(&self) -> &FleetStore {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventRecorder> {
        &self.events
    }

    pub fn provider(&self) -> &SimulatedProvider {
        &self.provider
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    pub fn backup(&self) -> &Arc<BackupWorker> {
        &self.backup
    }

    /// The public gate: open only after promotion completed.
    pub fn gate(&self) -> &LeadershipGate {
        &self.gate
    }

    pub fn restored(&self) -> RestoreReport {
        self.restored
    }

    /// Start the elector, the promotion task and the workers.
    pub fn start(&self, elector: Arc<dyn Elector>) -> SimulatorHandle {
        let (worker_tx, worker_rx) = watch::channel(false);
        let (election_tx, election_rx) = watch::channel(false);
        let (raw_handle, raw_gate) = leadership::channel();

        info!(elector = %elector.describe(), "Starting election");
        let election = tokio::spawn(async move { elector.run(raw_handle, election_rx).await });

        let promotion = tokio::spawn(promote(
            raw_gate,
            Arc::clone(&self.leadership),
            Arc::clone(&self.storage),
            self.store.clone(),
            Arc::clone(&self.events),
            Arc::clone(&self.backup),
            worker_rx.clone(),
        ));

        let mut workers = WorkerSet::new();
        {
            let backup = Arc::clone(&self.backup);
            let gate = self.gate.clone();
            let shutdown = worker_rx.clone();
            workers.spawn("backup", async move { backup.run(gate, shutdown).await });
        }
        {
            let chaos = ChaosWorker::new(self.provider.clone(), self.config.chaos.clone());
            let gate = self.gate.clone();
            let shutdown = worker_rx.clone();
            workers.spawn("chaos", async move { chaos.run(gate, shutdown).await });
        }
        {
            let janitor = JanitorWorker::new(self.provider.clone(), self.config.janitor.clone());
            let gate = self.gate.clone();
            let shutdown = worker_rx;
            workers.spawn("janitor", async move { janitor.run(gate, shutdown).await });
        }

        SimulatorHandle {
            gate: self.gate.clone(),
            workers,
            worker_tx,
            election,
            election_tx,
            promotion,
            timeout: self.config.shutdown_timeout,
        }
    }
}

async fn promote(
    raw: LeadershipGate,
    public: Arc<LeadershipHandle>,
    storage: Arc<dyn SnapshotStorage>,
    store: FleetStore,
    events: Arc<EventRecorder>,
    backup: Arc<BackupWorker>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RestoreError> {
    tokio::select! {
        res = raw.await_elected() => {
            if res.is_err() {
                public.revoke();
                return Ok(());
            }
        }
        _ = shutdown_requested(&mut shutdown) => return Ok(()),
    }

    let known = backup.status().last_version;
    match restore::catch_up(storage.as_ref(), &store, &events, known).await {
        Ok(Some(report)) => {
            if let Some(version) = report.version {
                backup.advance_to(version).await;
            }
            info!(version = ?report.version, "Caught up with previous leader");
        }
        Ok(None) => {}
        Err(e) => {
            error!(error = %e, "Catch-up restore failed, refusing leadership");
            public.revoke();
            return Err(e);
        }
    }

    if !raw.is_elected() {
        public.revoke();
        return Ok(());
    }
    public.elect();
    info!("Promoted to leader");

    tokio::select! {
        _ = raw.lost() => {
            if public.revoke() {
                warn!("Leadership lost");
            }
        }
        latest = backup.fenced() => {
            error!(%latest, "Storage holds a newer writer's snapshot, giving up leadership");
            public.revoke();
        }
    }
    Ok(())
}

/// Running tasks of a started simulator.
pub struct SimulatorHandle {
    gate: LeadershipGate,
    workers: WorkerSet,
    worker_tx: watch::Sender<bool>,
    election: JoinHandle<Result<(), ElectionError>>,
    election_tx: watch::Sender<bool>,
    promotion: JoinHandle<Result<(), RestoreError>>,
    timeout: Duration,
}

impl SimulatorHandle {
    /// Resolves when this replica stops being (or can no longer become)
    /// the leader.
    pub async fn lost(&self) {
        self.gate.lost().await;
    }

    /// Stop every task. Workers go first so a final backup can still be
    /// taken under leadership; the elector then releases leadership.
    pub async fn shutdown(self) -> Result<(), SimulatorError> {
        let _ = self.worker_tx.send(true);
        self.workers.join(self.timeout).await;

        let _ = self.election_tx.send(true);
        let election = join("election", self.election, self.timeout).await;
        let promotion = join("promotion", self.promotion, self.timeout).await;

        promotion?.map_err(SimulatorError::Restore)?;
        election?.map_err(SimulatorError::Election)?;
        Ok(())
    }
}

async fn join<T>(
    name: &'static str,
    handle: JoinHandle<T>,
    timeout: Duration,
) -> Result<T, SimulatorError> {
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(SimulatorError::Task(name, e.to_string())),
        Err(_) => Err(SimulatorError::Task(name, "did not stop in time".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use fleetsim_id::SnapshotVersion;

    use super::*;
    use crate::election::StandaloneElector;
    use crate::provider::LaunchSpec;
    use crate::runtime::SimulatedRuntime;
    use crate::snapshot::FleetSnapshot;
    use crate::storage::MemorySnapshotStorage;

    fn quiet() -> SimulatorConfig {
        SimulatorConfig {
            chaos: ChaosConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_standalone_promotes_and_shuts_down_with_final_backup() {
        let storage = Arc::new(MemorySnapshotStorage::new());
        let sim = Simulator::bootstrap(
            quiet(),
            storage.clone(),
            Arc::new(SimulatedRuntime::instant()),
        )
        .await
        .unwrap();
        assert!(sim.restored().is_cold_start());

        let handle = sim.start(Arc::new(StandaloneElector));
        sim.gate().await_elected().await.unwrap();

        sim.provider()
            .launch(LaunchSpec::of_type("sim.small"))
            .await
            .unwrap();
        handle.shutdown().await.unwrap();

        let latest = storage.read_latest().await.unwrap().unwrap();
        assert_eq!(latest.instance_count(), 1);
    }

    #[tokio::test]
    async fn test_promotion_applies_newer_snapshot_first() {
        let storage = Arc::new(MemorySnapshotStorage::new());
        let sim = Simulator::bootstrap(
            quiet(),
            storage.clone(),
            Arc::new(SimulatedRuntime::instant()),
        )
        .await
        .unwrap();

        // Another leader wrote while this replica was a follower.
        let mut other = crate::instance::SimulatedInstance::pending(
            fleetsim_id::InstanceId::new(),
            "sim.small",
            fleetsim_id::NodeId::new(),
            Default::default(),
        );
        other.status = fleetsim_events::InstanceStatus::Running;
        storage
            .write(&FleetSnapshot::new(SnapshotVersion::new(7), vec![other.clone()]))
            .await
            .unwrap();

        let handle = sim.start(Arc::new(StandaloneElector));
        sim.gate().await_elected().await.unwrap();
        assert_eq!(sim.store().get(other.id).await, Some(other));

        let version = sim.backup().backup_once().await.unwrap();
        assert_eq!(version, SnapshotVersion::new(8));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_catch_up_refuses_leadership() {
        let storage = Arc::new(MemorySnapshotStorage::new());
        let sim = Simulator::bootstrap(
            quiet(),
            storage.clone(),
            Arc::new(SimulatedRuntime::instant()),
        )
        .await
        .unwrap();
        storage
            .write(&FleetSnapshot::new(SnapshotVersion::new(2), Vec::new()))
            .await
            .unwrap();
        storage.overwrite_latest(b"not json".to_vec());

        let handle = sim.start(Arc::new(StandaloneElector));
        assert!(sim.gate().await_elected().await.is_err());
        handle.lost().await;

        let err = handle.shutdown().await.unwrap_err();
        assert!(matches!(err, SimulatorError::Restore(_)));
    }

    #[tokio::test]
    async fn test_fenced_backup_revokes_leadership() {
        let storage = Arc::new(MemorySnapshotStorage::new());
        let sim = Simulator::bootstrap(
            quiet(),
            storage.clone(),
            Arc::new(SimulatedRuntime::instant()),
        )
        .await
        .unwrap();
        let handle = sim.start(Arc::new(StandaloneElector));
        sim.gate().await_elected().await.unwrap();

        storage
            .write(&FleetSnapshot::new(SnapshotVersion::new(9), Vec::new()))
            .await
            .unwrap();
        let err = sim.backup().backup_once().await.unwrap_err();
        assert!(matches!(err, crate::backup::BackupError::Fenced { .. }));

        handle.lost().await;
        assert_eq!(
            sim.provider()
                .launch(LaunchSpec::of_type("sim.small"))
                .await
                .unwrap_err(),
            crate::provider::ProviderError::NotLeader
        );
        handle.shutdown().await.unwrap();
        assert_eq!(storage.versions(), vec![SnapshotVersion::new(9)]);
    }
}
