//! Event feed endpoint.

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use fleetsim_events::FleetEvent;
use fleetsim_id::EventId;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    /// Return events with event_id > after.
    pub after: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub items: Vec<FleetEvent>,
    /// Cursor for the next page; echoes `after` when nothing new arrived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_after: Option<EventId>,
}

/// GET /v1/events?after={event_id}&limit={n}
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> impl IntoResponse {
    let after = query.after.map(EventId::new);
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let items = state.events().since(after, limit);
    let next_after = items.last().map(|e| e.event_id).or(after);

    Json(EventsResponse { items, next_after })
}
