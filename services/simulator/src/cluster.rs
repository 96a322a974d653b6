//! Cluster state cache.
//!
//! Tracks desired capacity per instance type (set by the controllers) next
//! to what the simulated provider reports, and classifies each pool with
//! [`compare_capacity`]. Reports are always taken after a refresh from the
//! provider, so a launch or terminate is visible to the very next read.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use fleetsim_events::InstanceStatus;
use fleetsim_reconcile::{compare_capacity, CapacityComparison};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::provider::SimulatedProvider;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("unknown instance type: {0}")]
    UnknownInstanceType(String),
}

/// Capacity of one instance type pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolCapacity {
    pub instance_type: String,
    #[serde(flatten)]
    pub comparison: CapacityComparison,
}

/// Point-in-time capacity report.
#[derive(Debug, Clone, Serialize)]
pub struct CapacityReport {
    pub refreshed_at: DateTime<Utc>,
    pub pools: Vec<PoolCapacity>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Reported {
    running: u32,
    pending: u32,
}

#[derive(Debug, Default)]
struct ClusterView {
    desired: BTreeMap<String, u32>,
    reported: BTreeMap<String, Reported>,
    refreshed_at: Option<DateTime<Utc>>,
}

pub struct ClusterState {
    provider: SimulatedProvider,
    view: RwLock<ClusterView>,
}

impl ClusterState {
    pub fn new(provider: SimulatedProvider) -> Self {
        Self {
            provider,
            view: RwLock::new(ClusterView::default()),
        }
    }

    /// Declare (or clear, with `None`) the desired count for a type.
    pub async fn set_desired(
        &self,
        instance_type: &str,
        count: Option<u32>,
    ) -> Result<(), ClusterError> {
        if !self
            .provider
            .instance_types()
            .iter()
            .any(|t| t.name == instance_type)
        {
            return Err(ClusterError::UnknownInstanceType(instance_type.to_string()));
        }

        let mut view = self.view.write().await;
        match count {
            Some(n) => {
                view.desired.insert(instance_type.to_string(), n);
            }
            None => {
                view.desired.remove(instance_type);
            }
        }
        debug!(instance_type, desired = ?count, "Desired capacity updated");
        Ok(())
    }

    pub async fn desired(&self, instance_type: &str) -> Option<u32> {
        self.view.read().await.desired.get(instance_type).copied()
    }

    /// Pull the provider's current view of the fleet.
    pub async fn refresh(&self) {
        let mut reported: BTreeMap<String, Reported> = BTreeMap::new();
        for instance in self.provider.list().await {
            let entry = reported.entry(instance.instance_type).or_default();
            match instance.status {
                InstanceStatus::Running => entry.running += 1,
                InstanceStatus::Pending => entry.pending += 1,
                InstanceStatus::Terminating | InstanceStatus::Terminated => {}
            }
        }

        let mut view = self.view.write().await;
        view.reported = reported;
        view.refreshed_at = Some(Utc::now());
    }

    /// Refresh and compare desired against reported capacity for every pool
    /// that has either.
    pub async fn report(&self) -> CapacityReport {
        self.refresh().await;
        let view = self.view.read().await;

        let names: BTreeSet<&String> = view.desired.keys().chain(view.reported.keys()).collect();
        let pools = names
            .into_iter()
            .map(|name| {
                let reported = view.reported.get(name).copied().unwrap_or_default();
                PoolCapacity {
                    instance_type: name.clone(),
                    comparison: compare_capacity(
                        view.desired.get(name).copied(),
                        reported.running,
                        reported.pending,
                    ),
                }
            })
            .collect();

        CapacityReport {
            refreshed_at: view.refreshed_at.unwrap_or_else(Utc::now),
            pools,
        }
    }
}
