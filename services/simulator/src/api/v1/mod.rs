//! API v1 routes.

mod admin;
mod capacity;
mod events;
mod instances;

use axum::{routing::get, Router};

use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/instances", instances::routes())
        .route("/instance-types", get(instances::list_instance_types))
        .route("/events", get(events::list_events))
        .nest("/capacity", capacity::routes())
        .nest("/admin", admin::routes())
}
