//! Operator endpoints.

use axum::{extract::State, response::IntoResponse, routing::post, Json, Router};
use fleetsim_id::SnapshotVersion;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::backup::BackupError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/backup", post(trigger_backup))
}

#[derive(Debug, Serialize)]
pub struct BackupResponse {
    pub version: SnapshotVersion,
}

/// POST /v1/admin/backup
///
/// Takes a snapshot now, outside the timer. Followers refuse so that only
/// the leader ever writes to shared storage.
async fn trigger_backup(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    if !state.gate().is_elected() {
        return Err(ApiError::not_leader().with_request_id(ctx.request_id));
    }

    match state.backup().backup_once().await {
        Ok(version) => Ok(Json(BackupResponse { version })),
        Err(e) => {
            tracing::error!(error = %e, request_id = %ctx.request_id, "On-demand backup failed");
            let api = match e {
                BackupError::Fenced { .. } => ApiError::conflict("backup_fenced", e.to_string()),
                _ => ApiError::bad_gateway("backup_failed", e.to_string())
                    .with_retry_after_seconds(5),
            };
            Err(api.with_request_id(ctx.request_id))
        }
    }
}
