//! Event envelope - the common wrapper for all fleet events.

use chrono::{DateTime, Utc};
use fleetsim_id::{EventId, ReplicaId};
use serde::{Deserialize, Serialize};

use crate::FleetEventPayload;

/// Who caused the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A reconciliation controller calling the capacity provider.
    Controller,
    /// The chaos worker.
    Chaos,
    /// The janitor worker pruning terminated history.
    Janitor,
    /// The simulator itself (restore, backup, boot).
    #[default]
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::Controller => write!(f, "controller"),
            ActorType::Chaos => write!(f, "chaos"),
            ActorType::Janitor => write!(f, "janitor"),
            ActorType::System => write!(f, "system"),
        }
    }
}

/// Aggregate type for event routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    #[default]
    Instance,
    Snapshot,
    Fleet,
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregateType::Instance => "instance",
            AggregateType::Snapshot => "snapshot",
            AggregateType::Fleet => "fleet",
        };
        write!(f, "{}", s)
    }
}

/// The event envelope - common metadata for all events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    /// Process-wide monotonic event identifier.
    pub event_id: EventId,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The type of aggregate this event belongs to.
    pub aggregate_type: AggregateType,

    /// The ID of the aggregate instance.
    pub aggregate_id: String,

    /// The event type (e.g., "instance.launched", "instance.terminated").
    pub event_type: String,

    /// Schema version for this event type.
    pub event_version: i32,

    /// Type of actor that triggered the event.
    pub actor_type: ActorType,

    /// Replica that recorded the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_id: Option<ReplicaId>,

    /// Event-specific payload.
    pub payload: P,
}

/// A fully typed fleet event.
pub type FleetEvent = EventEnvelope<FleetEventPayload>;

impl FleetEvent {
    /// Builds a fleet event, deriving type and aggregate from the payload.
    pub fn from_payload(
        event_id: EventId,
        aggregate_id: impl Into<String>,
        actor_type: ActorType,
        replica_id: Option<ReplicaId>,
        payload: FleetEventPayload,
    ) -> Self {
        Self {
            event_id,
            occurred_at: Utc::now(),
            aggregate_type: payload.aggregate_type(),
            aggregate_id: aggregate_id.into(),
            event_type: payload.event_type().to_string(),
            event_version: 1,
            actor_type,
            replica_id,
            payload,
        }
    }
}
