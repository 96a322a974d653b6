//! In-memory fleet state store.
//!
//! The store is the single shared mutable resource of the simulator. All
//! mutations (launch, controller terminate, chaos terminate, tagging,
//! pruning, restore) take the write lock for the duration of one atomic
//! per-instance change; reads (list, describe, backup capture) take the read
//! lock and see a consistent point-in-time view.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleetsim_events::{InstanceStatus, TerminationCause};
use fleetsim_id::{InstanceId, NodeId};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::instance::SimulatedInstance;

/// Errors from state store operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("fleet is at capacity ({limit} live instances)")]
    CapacityExceeded { limit: usize },

    #[error("duplicate instance id: {0}")]
    DuplicateId(InstanceId),
}

/// Result of a lifecycle transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The transition was applied; `from` is the previous status.
    Applied { from: InstanceStatus },
    /// The instance is already at or past the requested status.
    AlreadyAt(InstanceStatus),
    /// No such instance.
    NotFound,
}

/// Result of a tag update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOutcome {
    Tagged(SimulatedInstance),
    /// The instance is terminating or terminated; tags are frozen.
    Gone(InstanceStatus),
    NotFound,
}

/// A consistent point-in-time copy of the store.
#[derive(Debug, Clone)]
pub struct StoreCapture {
    pub instances: Vec<SimulatedInstance>,
    pub revision: u64,
}

#[derive(Debug, Default)]
struct FleetState {
    instances: BTreeMap<InstanceId, SimulatedInstance>,
    /// Bumped on every committed mutation.
    revision: u64,
}

/// Shared handle to the fleet state.
#[derive(Debug, Clone, Default)]
pub struct FleetStore {
    inner: Arc<RwLock<FleetState>>,
}

impl FleetStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `Pending` instance with a fresh unique identifier.
    ///
    /// When `max_live` is set, the launch is rejected if that many
    /// Pending/Running instances already exist. The check and the insert
    /// happen under the same write lock.
    pub async fn create_pending(
        &self,
        instance_type: &str,
        node_id: NodeId,
        tags: BTreeMap<String, String>,
        max_live: Option<usize>,
    ) -> Result<SimulatedInstance, StoreError> {
        let mut state = self.inner.write().await;

        if let Some(limit) = max_live {
            let live = state
                .instances
                .values()
                .filter(|i| i.status.is_live())
                .count();
            if live >= limit {
                return Err(StoreError::CapacityExceeded { limit });
            }
        }

        let mut id = InstanceId::new();
        while state.instances.contains_key(&id) {
            id = InstanceId::new();
        }

        let instance = SimulatedInstance::pending(id, instance_type, node_id, tags);
        state.instances.insert(id, instance.clone());
        state.revision += 1;

        debug!(instance_id = %id, instance_type, "Instance created");
        Ok(instance)
    }

    /// Move an instance forward to `to`.
    ///
    /// Transitions are monotonic: asking for a status the instance has
    /// already reached (or passed) is a no-op reported as `AlreadyAt`.
    /// `cause` is recorded the first time termination begins.
    pub async fn transition(
        &self,
        id: InstanceId,
        to: InstanceStatus,
        cause: Option<TerminationCause>,
    ) -> TransitionOutcome {
        let mut state = self.inner.write().await;

        let Some(instance) = state.instances.get_mut(&id) else {
            return TransitionOutcome::NotFound;
        };

        let from = instance.status;
        if !from.can_transition_to(to) {
            return TransitionOutcome::AlreadyAt(from);
        }

        instance.status = to;
        if to.is_gone() && instance.termination_cause.is_none() {
            instance.termination_cause = cause;
        }
        if to == InstanceStatus::Terminated {
            instance.terminated_at = Some(Utc::now());
        }
        state.revision += 1;

        debug!(instance_id = %id, %from, %to, "Instance transitioned");
        TransitionOutcome::Applied { from }
    }

    /// Merge `tags` into a live instance's tags.
    pub async fn merge_tags(&self, id: InstanceId, tags: BTreeMap<String, String>) -> TagOutcome {
        let mut state = self.inner.write().await;

        let Some(instance) = state.instances.get_mut(&id) else {
            return TagOutcome::NotFound;
        };
        if instance.status.is_gone() {
            return TagOutcome::Gone(instance.status);
        }

        instance.tags.extend(tags);
        let updated = instance.clone();
        state.revision += 1;
        TagOutcome::Tagged(updated)
    }

    /// Describe one instance.
    pub async fn get(&self, id: InstanceId) -> Option<SimulatedInstance> {
        self.inner.read().await.instances.get(&id).cloned()
    }

    /// All instances (including terminated history), ordered by identifier.
    pub async fn list(&self) -> Vec<SimulatedInstance> {
        self.inner.read().await.instances.values().cloned().collect()
    }

    /// Identifiers of `Running` instances, ordered by identifier.
    pub async fn running_ids(&self) -> Vec<InstanceId> {
        self.inner
            .read()
            .await
            .instances
            .values()
            .filter(|i| i.is_running())
            .map(|i| i.id)
            .collect()
    }

    /// Take a consistent point-in-time copy for backup.
    pub async fn capture(&self) -> StoreCapture {
        let state = self.inner.read().await;
        StoreCapture {
            instances: state.instances.values().cloned().collect(),
            revision: state.revision,
        }
    }

    /// Replace the entire contents of the store.
    ///
    /// Used by restore. Either all instances are applied or none are.
    pub async fn replace_all(&self, instances: Vec<SimulatedInstance>) -> Result<(), StoreError> {
        let mut next = BTreeMap::new();
        for instance in instances {
            let id = instance.id;
            if next.insert(id, instance).is_some() {
                return Err(StoreError::DuplicateId(id));
            }
        }

        let mut state = self.inner.write().await;
        state.instances = next;
        state.revision += 1;
        Ok(())
    }

    /// Remove `Terminated` instances that terminated before `cutoff`.
    pub async fn prune_terminated(&self, cutoff: DateTime<Utc>) -> Vec<InstanceId> {
        let mut state = self.inner.write().await;

        let expired: Vec<InstanceId> = state
            .instances
            .values()
            .filter(|i| i.status == InstanceStatus::Terminated)
            .filter(|i| i.terminated_at.is_some_and(|t| t < cutoff))
            .map(|i| i.id)
            .collect();

        for id in &expired {
            state.instances.remove(id);
        }
        if !expired.is_empty() {
            state.revision += 1;
        }
        expired
    }

    /// Number of Pending/Running instances.
    pub async fn live_count(&self) -> usize {
        self.inner
            .read()
            .await
            .instances
            .values()
            .filter(|i| i.status.is_live())
            .count()
    }

    /// Total number of instances, including terminated history.
    pub async fn len(&self) -> usize {
        self.inner.read().await.instances.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Monotonic mutation counter.
    pub async fn revision(&self) -> u64 {
        self.inner.read().await.revision
    }
}
