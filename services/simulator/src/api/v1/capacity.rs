//! Desired versus reported capacity per instance type.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::cluster::ClusterError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_capacity))
        .route("/{instance_type}", put(set_desired))
}

/// `desired: null` clears the target for the pool.
#[derive(Debug, Deserialize)]
pub struct SetDesiredRequest {
    pub desired: Option<u32>,
}

/// GET /v1/capacity
async fn get_capacity(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cluster().report().await)
}

/// PUT /v1/capacity/{instance_type}
async fn set_desired(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_type): Path<String>,
    Json(req): Json<SetDesiredRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.gate().is_elected() {
        return Err(ApiError::not_leader().with_request_id(ctx.request_id));
    }

    state
        .cluster()
        .set_desired(&instance_type, req.desired)
        .await
        .map_err(|e| match e {
            ClusterError::UnknownInstanceType(_) => {
                ApiError::not_found("instance_type_not_found", e.to_string())
                    .with_request_id(ctx.request_id.clone())
            }
        })?;

    Ok(Json(state.cluster().report().await))
}
