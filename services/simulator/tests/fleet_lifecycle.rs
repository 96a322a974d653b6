//! End-to-end fleet scenarios.
//!
//! These drive a bootstrapped simulator through launch, terminate, backup,
//! restart and leadership loss, using the in-memory and on-disk snapshot
//! backends.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetsim_events::InstanceStatus;
use fleetsim_id::{InstanceId, NodeId, SnapshotVersion};
use fleetsim_simulator::{
    backup::BackupConfig,
    chaos::{ChaosConfig, ChaosSelection},
    election::{ElectionError, Elector, StandaloneElector},
    instance::SimulatedInstance,
    leadership::LeadershipHandle,
    provider::{GoneReason, LaunchSpec, ProviderError, TerminateOutcome},
    runtime::SimulatedRuntime,
    simulator::{Simulator, SimulatorConfig, SimulatorError, SimulatorHandle},
    snapshot::FleetSnapshot,
    storage::{MemorySnapshotStorage, SnapshotStorage, StorageBackend},
    worker::shutdown_requested,
};
use rstest::rstest;
use tokio::sync::watch;

fn quiet_config() -> SimulatorConfig {
    SimulatorConfig {
        chaos: ChaosConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn leader(
    config: SimulatorConfig,
    storage: Arc<dyn SnapshotStorage>,
) -> (Simulator, SimulatorHandle) {
    let sim = Simulator::bootstrap(config, storage, Arc::new(SimulatedRuntime::instant()))
        .await
        .unwrap();
    let handle = sim.start(Arc::new(StandaloneElector));
    sim.gate().await_elected().await.unwrap();
    (sim, handle)
}

/// Elects immediately, then loses leadership when told to.
struct ScriptedElector {
    revoke: watch::Receiver<bool>,
}

#[async_trait]
impl Elector for ScriptedElector {
    async fn run(
        &self,
        handle: LeadershipHandle,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ElectionError> {
        handle.elect();
        let mut revoke = self.revoke.clone();
        tokio::select! {
            _ = shutdown_requested(&mut revoke) => {
                handle.revoke();
                Err(ElectionError::LeaseLost {
                    holder: "rep_other".to_string(),
                })
            }
            _ = shutdown_requested(&mut shutdown) => Ok(()),
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

#[tokio::test]
async fn test_launch_three_then_terminate_one() {
    let (sim, handle) = leader(quiet_config(), Arc::new(MemorySnapshotStorage::new())).await;
    let provider = sim.provider();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let instance = provider.launch(LaunchSpec::of_type("sim.small")).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Running);
        ids.push(instance.id);
    }
    let distinct: HashSet<_> = ids.iter().collect();
    assert_eq!(distinct.len(), 3);

    let first = provider.terminate(ids[0]).await.unwrap();
    assert!(matches!(first, TerminateOutcome::Terminated(ref i) if i.status == InstanceStatus::Terminated));

    let second = provider.terminate(ids[0]).await.unwrap();
    assert_eq!(second, TerminateOutcome::AlreadyGone(GoneReason::Terminated));

    let listed = provider.list().await;
    let running = listed.iter().filter(|i| i.status == InstanceStatus::Running).count();
    let terminated = listed
        .iter()
        .filter(|i| i.status == InstanceStatus::Terminated)
        .count();
    assert_eq!(running, 2);
    assert_eq!(terminated, 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_launches_never_collide() {
    let (sim, handle) = leader(quiet_config(), Arc::new(MemorySnapshotStorage::new())).await;

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let provider = sim.provider().clone();
        tasks.push(tokio::spawn(async move {
            provider.launch(LaunchSpec::of_type("sim.medium")).await
        }));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        let instance = task.await.unwrap().unwrap();
        assert!(ids.insert(instance.id));
    }
    assert_eq!(ids.len(), 50);
    assert_eq!(sim.store().live_count().await, 50);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_terminates_apply_once() {
    let (sim, handle) = leader(quiet_config(), Arc::new(MemorySnapshotStorage::new())).await;
    let id = sim
        .provider()
        .launch(LaunchSpec::of_type("sim.small"))
        .await
        .unwrap()
        .id;

    let a = tokio::spawn({
        let provider = sim.provider().clone();
        async move { provider.terminate(id).await }
    });
    let b = tokio::spawn({
        let provider = sim.provider().clone();
        async move { provider.terminate(id).await }
    });
    let outcomes = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];

    let applied = outcomes
        .iter()
        .filter(|o| matches!(o, TerminateOutcome::Terminated(_)))
        .count();
    assert_eq!(applied, 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_backup_versions_strictly_increase() {
    let storage = Arc::new(MemorySnapshotStorage::new());
    let (sim, handle) = leader(quiet_config(), storage.clone()).await;

    let mut last = None;
    for _ in 0..4 {
        sim.provider()
            .launch(LaunchSpec::of_type("sim.small"))
            .await
            .unwrap();
        let version = sim.backup().backup_once().await.unwrap();
        if let Some(prev) = last {
            assert!(version > prev);
        }
        last = Some(version);
    }

    handle.shutdown().await.unwrap();
    let versions = storage.versions();
    assert!(versions.windows(2).all(|w| w[0] < w[1]));
}

fn backend(kind: &str, dir: &Path) -> StorageBackend {
    match kind {
        "file" => StorageBackend::File {
            dir: dir.to_path_buf(),
        },
        "sqlite" => StorageBackend::Sqlite {
            path: dir.join("snapshots.db"),
            retain: 3,
        },
        other => panic!("unknown backend {other}"),
    }
}

#[rstest]
#[case::file("file")]
#[case::sqlite("sqlite")]
#[tokio::test]
async fn test_restart_restores_backed_up_fleet(#[case] kind: &str) {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(kind, dir.path());

    let (sim, handle) = leader(quiet_config(), backend.open().unwrap()).await;
    let provider = sim.provider();
    let mut launched = Vec::new();
    for name in ["sim.small", "sim.large", "sim.xlarge"] {
        launched.push(provider.launch(LaunchSpec::of_type(name)).await.unwrap().id);
    }
    provider.terminate(launched[1]).await.unwrap();
    provider
        .tag(launched[2], BTreeMap::from([("pool".to_string(), "batch".to_string())]))
        .await
        .unwrap();
    sim.backup().backup_once().await.unwrap();
    let before = sim.store().list().await;
    handle.shutdown().await.unwrap();

    let restarted = Simulator::bootstrap(
        quiet_config(),
        backend.open().unwrap(),
        Arc::new(SimulatedRuntime::instant()),
    )
    .await
    .unwrap();

    assert!(!restarted.restored().is_cold_start());
    assert_eq!(restarted.restored().instance_count, 3);
    assert_eq!(restarted.store().list().await, before);
}

#[tokio::test]
async fn test_cold_start_on_empty_directory() {
    let dir = tempfile::tempdir().unwrap();
    let storage = backend("file", dir.path()).open().unwrap();

    let sim = Simulator::bootstrap(quiet_config(), storage, Arc::new(SimulatedRuntime::instant()))
        .await
        .unwrap();

    assert!(sim.restored().is_cold_start());
    assert!(sim.store().is_empty().await);
}

#[tokio::test]
async fn test_restart_settles_instances_caught_mid_transition() {
    let mut stopping = SimulatedInstance::pending(
        InstanceId::new(),
        "sim.small",
        NodeId::new(),
        BTreeMap::new(),
    );
    stopping.status = InstanceStatus::Terminating;
    let booting = SimulatedInstance::pending(
        InstanceId::new(),
        "sim.small",
        NodeId::new(),
        BTreeMap::new(),
    );
    let storage = Arc::new(MemorySnapshotStorage::new());
    storage
        .write(&FleetSnapshot::new(
            SnapshotVersion::new(3),
            vec![stopping.clone(), booting.clone()],
        ))
        .await
        .unwrap();

    let config = SimulatorConfig {
        max_instances: Some(1),
        ..quiet_config()
    };
    let (sim, handle) = leader(config, storage).await;
    let provider = sim.provider();

    assert_eq!(
        provider.terminate(stopping.id).await.unwrap(),
        TerminateOutcome::AlreadyGone(GoneReason::Terminated)
    );
    assert_eq!(
        provider.describe(booting.id).await.unwrap().status,
        InstanceStatus::Terminated
    );
    let launched = provider.launch(LaunchSpec::of_type("sim.small")).await.unwrap();
    assert_eq!(launched.status, InstanceStatus::Running);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_leadership_loss_stops_background_work() {
    let storage = Arc::new(MemorySnapshotStorage::new());
    let config = SimulatorConfig {
        backup: BackupConfig {
            interval: Duration::from_secs(1),
            ..Default::default()
        },
        chaos: ChaosConfig {
            enabled: true,
            interval: Duration::from_secs(1),
            jitter: Duration::ZERO,
            selection: ChaosSelection::Fixed { count: 1 },
            min_survivors: 0,
            seed: Some(7),
        },
        ..Default::default()
    };
    let sim = Simulator::bootstrap(config, storage.clone(), Arc::new(SimulatedRuntime::instant()))
        .await
        .unwrap();

    let (revoke_tx, revoke_rx) = watch::channel(false);
    let handle = sim.start(Arc::new(ScriptedElector { revoke: revoke_rx }));
    sim.gate().await_elected().await.unwrap();

    for _ in 0..10 {
        sim.provider()
            .launch(LaunchSpec::of_type("sim.small"))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(!storage.versions().is_empty());

    revoke_tx.send(true).unwrap();
    handle.lost().await;
    assert!(!sim.gate().is_elected());

    let versions = storage.versions();
    let live = sim.store().live_count().await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(storage.versions(), versions);
    assert_eq!(sim.store().live_count().await, live);

    let err = sim
        .provider()
        .launch(LaunchSpec::of_type("sim.small"))
        .await
        .unwrap_err();
    assert_eq!(err, ProviderError::NotLeader);

    // Whatever was last written is a complete snapshot.
    let latest = storage.read_latest().await.unwrap().unwrap();
    assert!(latest.verify().is_ok());

    let err = handle.shutdown().await.unwrap_err();
    assert!(matches!(
        err,
        SimulatorError::Election(ElectionError::LeaseLost { .. })
    ));
}
