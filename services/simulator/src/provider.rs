//! Simulated capacity provider.
//!
//! This is the surface reconciliation controllers drive: launch, terminate,
//! list, describe and tag. Every mutation goes through the shared
//! [`FleetStore`] and is recorded as a fleet event. Mutations are refused
//! with [`ProviderError::NotLeader`] unless this replica holds leadership;
//! reads are always served from the local copy.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleetsim_events::{
    ActorType, FleetEventPayload, InstanceLaunchedPayload, InstanceStatus,
    InstanceStatusChangedPayload, InstanceTaggedPayload, TerminationCause,
};
use fleetsim_id::{InstanceId, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{InstanceType, InstanceTypeProvider, StaticCatalog};
use crate::events::EventRecorder;
use crate::instance::SimulatedInstance;
use crate::leadership::LeadershipGate;
use crate::runtime::{InstanceRuntime, SimulatedRuntime};
use crate::store::{FleetStore, StoreError, TagOutcome, TransitionOutcome};

/// Errors returned to capacity-provider callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("this replica is not the leader")]
    NotLeader,

    #[error("invalid launch spec: {0}")]
    InvalidSpec(String),

    #[error("insufficient capacity: fleet limit of {limit} live instances reached")]
    InsufficientCapacity { limit: usize },

    #[error("instance {instance_id} failed to launch: {reason}")]
    LaunchFailed {
        instance_id: InstanceId,
        reason: String,
    },
}

impl ProviderError {
    /// Whether the caller should retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::NotLeader | ProviderError::InsufficientCapacity { .. }
        )
    }
}

/// Launch constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Acceptable instance types in preference order.
    pub instance_types: Vec<String>,
    /// Place on this node; a new node is minted when absent.
    #[serde(default)]
    pub node: Option<NodeId>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl LaunchSpec {
    pub fn of_type(instance_type: impl Into<String>) -> Self {
        Self {
            instance_types: vec![instance_type.into()],
            ..Default::default()
        }
    }
}

/// Why a terminate or tag request had nothing to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoneReason {
    NotFound,
    Terminating,
    Terminated,
}

impl GoneReason {
    fn from_status(status: InstanceStatus) -> Self {
        match status {
            InstanceStatus::Terminated => GoneReason::Terminated,
            _ => GoneReason::Terminating,
        }
    }
}

/// Result of a terminate request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// This call performed the termination.
    Terminated(SimulatedInstance),
    /// Someone else already did, or the instance never existed.
    AlreadyGone(GoneReason),
}

/// Result of a tag request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagResult {
    Tagged(SimulatedInstance),
    AlreadyGone(GoneReason),
}

/// The simulated cloud provider.
#[derive(Clone)]
pub struct SimulatedProvider {
    store: FleetStore,
    gate: LeadershipGate,
    events: Arc<EventRecorder>,
    catalog: Arc<dyn InstanceTypeProvider>,
    runtime: Arc<dyn InstanceRuntime>,
    max_instances: Option<usize>,
}

impl SimulatedProvider {
    pub fn new(store: FleetStore, gate: LeadershipGate, events: Arc<EventRecorder>) -> Self {
        Self {
            store,
            gate,
            events,
            catalog: Arc::new(StaticCatalog::builtin()),
            runtime: Arc::new(SimulatedRuntime::instant()),
            max_instances: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn InstanceTypeProvider>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn InstanceRuntime>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_max_instances(mut self, max_instances: Option<usize>) -> Self {
        self.max_instances = max_instances;
        self
    }

    pub fn store(&self) -> &FleetStore {
        &self.store
    }

    pub fn gate(&self) -> &LeadershipGate {
        &self.gate
    }

    pub fn events(&self) -> &Arc<EventRecorder> {
        &self.events
    }

    pub fn instance_types(&self) -> Vec<InstanceType> {
        self.catalog.list()
    }

    fn ensure_leader(&self) -> Result<(), ProviderError> {
        if self.gate.is_elected() {
            Ok(())
        } else {
            Err(ProviderError::NotLeader)
        }
    }

    fn resolve_type(&self, spec: &LaunchSpec) -> Result<String, ProviderError> {
        if spec.instance_types.is_empty() {
            return Err(ProviderError::InvalidSpec(
                "at least one instance type is required".to_string(),
            ));
        }
        spec.instance_types
            .iter()
            .find(|t| self.catalog.contains(t))
            .cloned()
            .ok_or_else(|| {
                ProviderError::InvalidSpec(format!(
                    "no known instance type among {:?}",
                    spec.instance_types
                ))
            })
    }

    /// Launch an instance and wait for it to boot.
    ///
    /// The instance is visible as `Pending` while booting. A boot failure
    /// leaves it `Terminated` with cause `boot_failure`.
    pub async fn launch(&self, spec: LaunchSpec) -> Result<SimulatedInstance, ProviderError> {
        self.ensure_leader()?;
        let instance_type = self.resolve_type(&spec)?;
        let node_id = spec.node.unwrap_or_default();

        let instance = self
            .store
            .create_pending(&instance_type, node_id, spec.tags, self.max_instances)
            .await
            .map_err(|e| match e {
                StoreError::CapacityExceeded { limit } => {
                    ProviderError::InsufficientCapacity { limit }
                }
                StoreError::DuplicateId(id) => ProviderError::LaunchFailed {
                    instance_id: id,
                    reason: "duplicate instance id".to_string(),
                },
            })?;

        self.events.record(
            instance.id.to_string(),
            ActorType::Controller,
            FleetEventPayload::InstanceLaunched(InstanceLaunchedPayload {
                instance_type: instance.instance_type.clone(),
                node_id: instance.node_id,
                tags: instance.tags.clone(),
            }),
        );
        info!(
            instance_id = %instance.id,
            instance_type = %instance.instance_type,
            node_id = %instance.node_id,
            "Instance launched"
        );

        // Boot runs detached so a caller that goes away mid-launch cannot
        // leave the instance stuck in `Pending`.
        let provider = self.clone();
        let booting = instance.clone();
        let booted = tokio::spawn(async move { provider.finish_launch(booting).await })
            .await
            .unwrap_or_else(|e| Err(format!("boot task failed: {e}")));
        if let Err(reason) = booted {
            return Err(ProviderError::LaunchFailed {
                instance_id: instance.id,
                reason,
            });
        }

        // Chaos may already have taken it; report whatever is current.
        Ok(self.store.get(instance.id).await.unwrap_or(instance))
    }

    async fn finish_launch(&self, instance: SimulatedInstance) -> Result<(), String> {
        if let Err(e) = self.runtime.boot(&instance).await {
            warn!(instance_id = %instance.id, error = %e, "Instance failed to boot");
            self.apply(
                instance.id,
                InstanceStatus::Terminated,
                Some(TerminationCause::BootFailure),
                ActorType::System,
            )
            .await;
            return Err(e.to_string());
        }
        self.apply(instance.id, InstanceStatus::Running, None, ActorType::System)
            .await;
        Ok(())
    }

    /// Terminate an instance on behalf of a controller.
    pub async fn terminate(&self, id: InstanceId) -> Result<TerminateOutcome, ProviderError> {
        self.terminate_with_cause(id, TerminationCause::Controller)
            .await
    }

    /// Terminate an instance, recording `cause`.
    ///
    /// The first caller moves the instance to `Terminating` and finishes the
    /// job; concurrent callers observe `AlreadyGone` and do nothing. Once
    /// `Terminating` is committed the instance reaches `Terminated` even if
    /// this future is dropped or leadership is lost meanwhile.
    pub async fn terminate_with_cause(
        &self,
        id: InstanceId,
        cause: TerminationCause,
    ) -> Result<TerminateOutcome, ProviderError> {
        self.ensure_leader()?;
        let actor = actor_for(cause);

        match self
            .apply(id, InstanceStatus::Terminating, Some(cause), actor)
            .await
        {
            TransitionOutcome::Applied { .. } => {}
            TransitionOutcome::AlreadyAt(status) => {
                debug!(instance_id = %id, %status, "Terminate is a no-op");
                return Ok(TerminateOutcome::AlreadyGone(GoneReason::from_status(
                    status,
                )));
            }
            TransitionOutcome::NotFound => {
                return Ok(TerminateOutcome::AlreadyGone(GoneReason::NotFound));
            }
        }

        let provider = self.clone();
        let finished = tokio::spawn(async move {
            provider.finish_termination(id, cause, actor).await;
        })
        .await;
        if let Err(e) = finished {
            warn!(instance_id = %id, error = %e, "Termination task failed");
        }

        Ok(match self.store.get(id).await {
            Some(instance) => TerminateOutcome::Terminated(instance),
            None => TerminateOutcome::AlreadyGone(GoneReason::NotFound),
        })
    }

    async fn finish_termination(&self, id: InstanceId, cause: TerminationCause, actor: ActorType) {
        if let Some(instance) = self.store.get(id).await {
            self.runtime.shutdown(&instance).await;
        }
        self.apply(id, InstanceStatus::Terminated, Some(cause), actor)
            .await;
        info!(instance_id = %id, %cause, "Instance terminated");
    }

    /// Merge tags into a live instance.
    pub async fn tag(
        &self,
        id: InstanceId,
        tags: BTreeMap<String, String>,
    ) -> Result<TagResult, ProviderError> {
        self.ensure_leader()?;

        match self.store.merge_tags(id, tags.clone()).await {
            TagOutcome::Tagged(instance) => {
                self.events.record(
                    id.to_string(),
                    ActorType::Controller,
                    FleetEventPayload::InstanceTagged(InstanceTaggedPayload { tags }),
                );
                Ok(TagResult::Tagged(instance))
            }
            TagOutcome::Gone(status) => {
                Ok(TagResult::AlreadyGone(GoneReason::from_status(status)))
            }
            TagOutcome::NotFound => Ok(TagResult::AlreadyGone(GoneReason::NotFound)),
        }
    }

    /// All instances, including terminated history.
    pub async fn list(&self) -> Vec<SimulatedInstance> {
        self.store.list().await
    }

    pub async fn describe(&self, id: InstanceId) -> Option<SimulatedInstance> {
        self.store.get(id).await
    }

    async fn apply(
        &self,
        id: InstanceId,
        to: InstanceStatus,
        cause: Option<TerminationCause>,
        actor: ActorType,
    ) -> TransitionOutcome {
        let outcome = self.store.transition(id, to, cause).await;
        if let TransitionOutcome::Applied { from } = outcome {
            self.events.record(
                id.to_string(),
                actor,
                FleetEventPayload::InstanceStatusChanged(InstanceStatusChangedPayload {
                    from,
                    to,
                    cause: if to.is_gone() { cause } else { None },
                }),
            );
        }
        outcome
    }
}

fn actor_for(cause: TerminationCause) -> ActorType {
    match cause {
        TerminationCause::Controller => ActorType::Controller,
        TerminationCause::Chaos => ActorType::Chaos,
        TerminationCause::BootFailure => ActorType::System,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use fleetsim_events::event_types;
    use rstest::rstest;

    use super::*;
    use crate::leadership::{self, LeadershipHandle};

    fn provider() -> (SimulatedProvider, LeadershipHandle) {
        let (handle, gate) = leadership::channel();
        handle.elect();
        let provider = SimulatedProvider::new(
            FleetStore::new(),
            gate,
            Arc::new(EventRecorder::new(None, 128)),
        );
        (provider, handle)
    }

    #[tokio::test]
    async fn test_launch_three_distinct_running() {
        let (provider, _handle) = provider();
        let mut ids = HashSet::new();
        for _ in 0..3 {
            let inst = provider
                .launch(LaunchSpec::of_type("sim.small"))
                .await
                .unwrap();
            assert_eq!(inst.status, InstanceStatus::Running);
            ids.insert(inst.id);
        }
        assert_eq!(ids.len(), 3);
        assert_eq!(provider.store().running_ids().await.len(), 3);
    }

    #[tokio::test]
    async fn test_double_terminate_is_single_transition() {
        let (provider, _handle) = provider();
        let id = provider
            .launch(LaunchSpec::of_type("sim.small"))
            .await
            .unwrap()
            .id;

        let first = provider.terminate(id).await.unwrap();
        match first {
            TerminateOutcome::Terminated(inst) => {
                assert_eq!(inst.status, InstanceStatus::Terminated);
                assert_eq!(inst.termination_cause, Some(TerminationCause::Controller));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            provider.terminate(id).await.unwrap(),
            TerminateOutcome::AlreadyGone(GoneReason::Terminated)
        );

        let terminated_events = provider
            .events()
            .since(None, 100)
            .into_iter()
            .filter(|e| e.event_type == event_types::INSTANCE_TERMINATED)
            .count();
        assert_eq!(terminated_events, 1);
    }

    #[tokio::test]
    async fn test_terminate_unknown_is_already_gone() {
        let (provider, _handle) = provider();
        assert_eq!(
            provider.terminate(InstanceId::new()).await.unwrap(),
            TerminateOutcome::AlreadyGone(GoneReason::NotFound)
        );
    }

    #[rstest]
    #[case(vec!["m5.large", "sim.medium", "sim.small"], "sim.medium")]
    #[case(vec!["sim.xlarge"], "sim.xlarge")]
    #[tokio::test]
    async fn test_launch_uses_first_known_type(#[case] types: Vec<&str>, #[case] expected: &str) {
        let (provider, _handle) = provider();
        let spec = LaunchSpec {
            instance_types: types.into_iter().map(String::from).collect(),
            ..Default::default()
        };
        let inst = provider.launch(spec).await.unwrap();
        assert_eq!(inst.instance_type, expected);
    }

    #[rstest]
    #[case(vec![])]
    #[case(vec!["m5.large"])]
    #[tokio::test]
    async fn test_launch_rejects_unknown_types(#[case] types: Vec<&str>) {
        let (provider, _handle) = provider();
        let spec = LaunchSpec {
            instance_types: types.into_iter().map(String::from).collect(),
            ..Default::default()
        };
        let err = provider.launch(spec).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidSpec(_)));
        assert!(provider.store().is_empty().await);
    }

    #[tokio::test]
    async fn test_launch_respects_fleet_cap() {
        let (provider, _handle) = provider();
        let provider = provider.with_max_instances(Some(2));
        for _ in 0..2 {
            provider
                .launch(LaunchSpec::of_type("sim.small"))
                .await
                .unwrap();
        }
        let err = provider
            .launch(LaunchSpec::of_type("sim.small"))
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::InsufficientCapacity { limit: 2 });
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_boot_failure_terminates_instance() {
        let (provider, _handle) = provider();
        let runtime = Arc::new(SimulatedRuntime::instant());
        runtime.fail_next_boots(1);
        let provider = provider.with_runtime(runtime);

        let err = provider
            .launch(LaunchSpec::of_type("sim.small"))
            .await
            .unwrap_err();
        let ProviderError::LaunchFailed { instance_id, .. } = err else {
            panic!("unexpected error: {err:?}");
        };
        let inst = provider.describe(instance_id).await.unwrap();
        assert_eq!(inst.status, InstanceStatus::Terminated);
        assert_eq!(inst.termination_cause, Some(TerminationCause::BootFailure));
    }

    #[tokio::test]
    async fn test_mutations_require_leadership() {
        let (handle, gate) = leadership::channel();
        let provider = SimulatedProvider::new(
            FleetStore::new(),
            gate,
            Arc::new(EventRecorder::new(None, 16)),
        );

        let err = provider
            .launch(LaunchSpec::of_type("sim.small"))
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::NotLeader);
        assert_eq!(
            provider.terminate(InstanceId::new()).await.unwrap_err(),
            ProviderError::NotLeader
        );
        // Reads are served regardless.
        assert!(provider.list().await.is_empty());

        handle.elect();
        provider
            .launch(LaunchSpec::of_type("sim.small"))
            .await
            .unwrap();

        handle.revoke();
        assert_eq!(
            provider
                .tag(InstanceId::new(), BTreeMap::new())
                .await
                .unwrap_err(),
            ProviderError::NotLeader
        );
    }

    #[tokio::test]
    async fn test_tag_live_and_gone() {
        let (provider, _handle) = provider();
        let id = provider
            .launch(LaunchSpec::of_type("sim.small"))
            .await
            .unwrap()
            .id;

        let tags = BTreeMap::from([("pool".to_string(), "batch".to_string())]);
        match provider.tag(id, tags).await.unwrap() {
            TagResult::Tagged(inst) => assert_eq!(inst.tags["pool"], "batch"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        provider.terminate(id).await.unwrap();
        assert_eq!(
            provider.tag(id, BTreeMap::new()).await.unwrap(),
            TagResult::AlreadyGone(GoneReason::Terminated)
        );
    }

    #[tokio::test]
    async fn test_concurrent_terminates_yield_one_winner() {
        let (provider, _handle) = provider();
        let runtime = Arc::new(SimulatedRuntime::new(
            std::time::Duration::ZERO,
            std::time::Duration::from_millis(20),
        ));
        let provider = provider.with_runtime(runtime);
        let id = provider
            .launch(LaunchSpec::of_type("sim.small"))
            .await
            .unwrap()
            .id;

        let a = tokio::spawn({
            let p = provider.clone();
            async move { p.terminate(id).await }
        });
        let b = tokio::spawn({
            let p = provider.clone();
            async move { p.terminate_with_cause(id, TerminationCause::Chaos).await }
        });
        let outcomes = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];

        let winners = outcomes
            .iter()
            .filter(|o| matches!(o, TerminateOutcome::Terminated(_)))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(
            provider.describe(id).await.unwrap().status,
            InstanceStatus::Terminated
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_terminate_still_completes() {
        let (provider, handle) = provider();
        let runtime = Arc::new(SimulatedRuntime::new(
            std::time::Duration::ZERO,
            std::time::Duration::from_secs(5),
        ));
        let provider = provider.with_runtime(runtime);
        let id = provider
            .launch(LaunchSpec::of_type("sim.small"))
            .await
            .unwrap()
            .id;

        let call = tokio::spawn({
            let p = provider.clone();
            async move { p.terminate(id).await }
        });
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert_eq!(
            provider.describe(id).await.unwrap().status,
            InstanceStatus::Terminating
        );
        call.abort();
        handle.revoke();

        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        let inst = provider.describe(id).await.unwrap();
        assert_eq!(inst.status, InstanceStatus::Terminated);
        assert_eq!(inst.termination_cause, Some(TerminationCause::Controller));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_launch_still_boots() {
        let (provider, _handle) = provider();
        let runtime = Arc::new(SimulatedRuntime::new(
            std::time::Duration::from_secs(5),
            std::time::Duration::ZERO,
        ));
        let provider = provider.with_runtime(runtime).with_max_instances(Some(1));

        let call = tokio::spawn({
            let p = provider.clone();
            async move { p.launch(LaunchSpec::of_type("sim.small")).await }
        });
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        call.abort();

        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        let listed = provider.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, InstanceStatus::Running);
    }
}
