//! Event payload definitions and shared lifecycle enums.

use std::collections::BTreeMap;

use fleetsim_id::{NodeId, SnapshotVersion};
use serde::{Deserialize, Serialize};

// =============================================================================
// Event Type Constants
// =============================================================================

/// Event type string constants.
pub mod event_types {
    // Instance events
    pub const INSTANCE_LAUNCHED: &str = "instance.launched";
    pub const INSTANCE_RUNNING: &str = "instance.running";
    pub const INSTANCE_TERMINATING: &str = "instance.terminating";
    pub const INSTANCE_TERMINATED: &str = "instance.terminated";
    pub const INSTANCE_TAGGED: &str = "instance.tagged";
    pub const INSTANCE_PRUNED: &str = "instance.pruned";

    // Snapshot events
    pub const SNAPSHOT_WRITTEN: &str = "snapshot.written";

    // Fleet events
    pub const FLEET_RESTORED: &str = "fleet.restored";
}

// =============================================================================
// Status Enums
// =============================================================================

/// Lifecycle status of a simulated instance.
///
/// Variants are declared in lifecycle order; the derived `Ord` is the
/// transition order. A status may only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Terminating,
    Terminated,
}

impl InstanceStatus {
    /// Returns true if moving from `self` to `next` keeps the lifecycle monotonic.
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        next > *self
    }

    /// Returns true once termination has begun (Terminating or Terminated).
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Terminating | Self::Terminated)
    }

    /// Returns true for statuses that count toward live capacity.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an instance was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    /// A reconciliation controller asked for it.
    Controller,
    /// Injected failure from the chaos worker.
    Chaos,
    /// The simulated runtime failed to boot the instance.
    BootFailure,
}

impl std::fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Controller => "controller",
            Self::Chaos => "chaos",
            Self::BootFailure => "boot_failure",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Payload for `instance.launched`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceLaunchedPayload {
    pub instance_type: String,
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Payload for `instance.running`, `instance.terminating` and `instance.terminated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatusChangedPayload {
    pub from: InstanceStatus,
    pub to: InstanceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<TerminationCause>,
}

/// Payload for `instance.tagged`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceTaggedPayload {
    pub tags: BTreeMap<String, String>,
}

/// Payload for `snapshot.written`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotWrittenPayload {
    pub version: SnapshotVersion,
    pub instance_count: usize,
}

/// Payload for `fleet.restored`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetRestoredPayload {
    /// `None` on a cold start.
    pub version: Option<SnapshotVersion>,
    pub instance_count: usize,
}

/// All fleet event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FleetEventPayload {
    InstanceLaunched(InstanceLaunchedPayload),
    InstanceStatusChanged(InstanceStatusChangedPayload),
    InstanceTagged(InstanceTaggedPayload),
    InstancePruned,
    SnapshotWritten(SnapshotWrittenPayload),
    FleetRestored(FleetRestoredPayload),
}

impl FleetEventPayload {
    /// The event type string for this payload.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::InstanceLaunched(_) => event_types::INSTANCE_LAUNCHED,
            Self::InstanceStatusChanged(p) => match p.to {
                InstanceStatus::Pending => event_types::INSTANCE_LAUNCHED,
                InstanceStatus::Running => event_types::INSTANCE_RUNNING,
                InstanceStatus::Terminating => event_types::INSTANCE_TERMINATING,
                InstanceStatus::Terminated => event_types::INSTANCE_TERMINATED,
            },
            Self::InstanceTagged(_) => event_types::INSTANCE_TAGGED,
            Self::InstancePruned => event_types::INSTANCE_PRUNED,
            Self::SnapshotWritten(_) => event_types::SNAPSHOT_WRITTEN,
            Self::FleetRestored(_) => event_types::FLEET_RESTORED,
        }
    }

    /// The aggregate this payload belongs to.
    pub fn aggregate_type(&self) -> crate::AggregateType {
        match self {
            Self::InstanceLaunched(_)
            | Self::InstanceStatusChanged(_)
            | Self::InstanceTagged(_)
            | Self::InstancePruned => crate::AggregateType::Instance,
            Self::SnapshotWritten(_) => crate::AggregateType::Snapshot,
            Self::FleetRestored(_) => crate::AggregateType::Fleet,
        }
    }
}
