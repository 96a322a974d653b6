//! Fleet event recorder.
//!
//! Every applied lifecycle transition is recorded here. Live subscribers get
//! events through a broadcast channel; late readers page through a bounded
//! in-memory history by event ID.

use std::collections::VecDeque;
use std::sync::Mutex;

use fleetsim_events::{ActorType, FleetEvent, FleetEventPayload};
use fleetsim_id::{EventId, ReplicaId};
use tokio::sync::broadcast;
use tracing::debug;

/// Default number of events retained for polling readers.
pub const DEFAULT_HISTORY_CAPACITY: usize = 4096;

struct History {
    events: VecDeque<FleetEvent>,
    last_id: i64,
}

/// Records fleet events and fans them out to subscribers.
pub struct EventRecorder {
    replica_id: Option<ReplicaId>,
    capacity: usize,
    history: Mutex<History>,
    tx: broadcast::Sender<FleetEvent>,
}

impl EventRecorder {
    pub fn new(replica_id: Option<ReplicaId>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            replica_id,
            capacity,
            history: Mutex::new(History {
                events: VecDeque::with_capacity(capacity),
                last_id: 0,
            }),
            tx,
        }
    }

    /// Record an event and return it with its assigned ID.
    pub fn record(
        &self,
        aggregate_id: impl Into<String>,
        actor: ActorType,
        payload: FleetEventPayload,
    ) -> FleetEvent {
        let mut history = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        history.last_id += 1;
        let event = FleetEvent::from_payload(
            EventId::new(history.last_id),
            aggregate_id,
            actor,
            self.replica_id,
            payload,
        );

        if history.events.len() == self.capacity {
            history.events.pop_front();
        }
        history.events.push_back(event.clone());

        // Sent under the lock so subscribers see IDs in order.
        let _ = self.tx.send(event.clone());

        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            actor = %event.actor_type,
            "Event recorded"
        );
        event
    }

    /// Subscribe to events recorded from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    /// Retained events with an ID greater than `after`, oldest first.
    pub fn since(&self, after: Option<EventId>, limit: usize) -> Vec<FleetEvent> {
        let history = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        history
            .events
            .iter()
            .filter(|e| after.is_none_or(|a| e.event_id > a))
            .take(limit)
            .cloned()
            .collect()
    }
}
