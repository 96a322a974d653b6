//! Application state shared across request handlers.

use std::sync::Arc;

use fleetsim_id::ReplicaId;

use crate::backup::BackupWorker;
use crate::cluster::ClusterState;
use crate::events::EventRecorder;
use crate::leadership::LeadershipGate;
use crate::provider::SimulatedProvider;
use crate::simulator::Simulator;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    replica_id: ReplicaId,
    provider: SimulatedProvider,
    cluster: Arc<ClusterState>,
    backup: Arc<BackupWorker>,
}

impl AppState {
    pub fn new(simulator: &Simulator) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                replica_id: simulator.replica_id(),
                provider: simulator.provider().clone(),
                cluster: Arc::clone(simulator.cluster()),
                backup: Arc::clone(simulator.backup()),
            }),
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.inner.replica_id
    }

    pub fn provider(&self) -> &SimulatedProvider {
        &self.inner.provider
    }

    pub fn cluster(&self) -> &ClusterState {
        &self.inner.cluster
    }

    pub fn backup(&self) -> &BackupWorker {
        &self.inner.backup
    }

    pub fn gate(&self) -> &LeadershipGate {
        self.inner.provider.gate()
    }

    pub fn events(&self) -> &EventRecorder {
        self.inner.provider.events()
    }
}
