//! Simulated instance model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleetsim_events::{InstanceStatus, TerminationCause};
use fleetsim_id::{InstanceId, NodeId};
use serde::{Deserialize, Serialize};

/// One member of the simulated fleet.
///
/// This is both the State Store record and the descriptor returned by
/// list/describe, so what a controller sees is exactly what gets persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedInstance {
    pub id: InstanceId,
    pub instance_type: String,
    pub node_id: NodeId,
    pub status: InstanceStatus,
    pub launched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_cause: Option<TerminationCause>,
}

impl SimulatedInstance {
    /// A freshly launched instance in `Pending`.
    pub fn pending(
        id: InstanceId,
        instance_type: impl Into<String>,
        node_id: NodeId,
        tags: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id,
            instance_type: instance_type.into(),
            node_id,
            status: InstanceStatus::Pending,
            launched_at: Utc::now(),
            tags,
            terminated_at: None,
            termination_cause: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    /// Finish a lifecycle step that was in flight when this record was
    /// captured. Nothing is booting or shutting down after a restore, so a
    /// `Pending` instance never came up and a `Terminating` one is gone.
    ///
    /// Returns the status it was settled from, if it changed.
    pub fn settle(&mut self, at: DateTime<Utc>) -> Option<InstanceStatus> {
        let from = self.status;
        match from {
            InstanceStatus::Pending => {
                self.termination_cause.get_or_insert(TerminationCause::BootFailure);
            }
            InstanceStatus::Terminating => {}
            InstanceStatus::Running | InstanceStatus::Terminated => return None,
        }
        self.status = InstanceStatus::Terminated;
        self.terminated_at.get_or_insert(at);
        Some(from)
    }
}
