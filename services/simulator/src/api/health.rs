//! Health check endpoints.
//!
//! Readiness follows leadership: only the leader serves mutations, so a
//! follower reports itself unready and load balancers route elsewhere.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use fleetsim_id::{ReplicaId, SnapshotVersion};
use serde::Serialize;

use crate::leadership::LeadershipState;
use crate::state::AppState;

const SERVICE: &str = "fleet-simulator";

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub replica_id: ReplicaId,
    pub leadership: String,
    pub backup: BackupHealth,
}

#[derive(Debug, Serialize)]
pub struct BackupHealth {
    /// "ok", "degraded", "fenced" once a newer writer was seen, or "none"
    /// before the first snapshot exists.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_version: Option<SnapshotVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

fn response(status: &str, components: Option<ComponentHealth>) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: SERVICE.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components,
    }
}

/// Returns 200 whenever the server is up. Does not check leadership.
async fn healthz() -> impl IntoResponse {
    Json(response("ok", None))
}

/// Returns 503 unless this replica holds leadership.
///
/// Backup failures degrade the status but keep the replica ready; the
/// worker retries every cycle and the fleet itself is still served.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let leadership = state.gate().state();
    let backup = state.backup().status();

    let backup_status = match (backup.last_version, backup.consecutive_failures) {
        _ if backup.fenced_by.is_some() => "fenced",
        (_, n) if n > 0 => "degraded",
        (None, _) => "none",
        (Some(_), _) => "ok",
    };
    let leader = leadership == LeadershipState::Elected;
    let status = if !leader || backup.consecutive_failures > 0 {
        "degraded"
    } else {
        "ok"
    };

    let body = response(
        status,
        Some(ComponentHealth {
            replica_id: state.replica_id(),
            leadership: leadership.as_str().to_string(),
            backup: BackupHealth {
                status: backup_status.to_string(),
                last_version: backup.last_version,
                last_success_at: backup.last_success_at,
                consecutive_failures: backup.consecutive_failures,
            },
        }),
    );

    if leader {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

/// Process liveness. A replica that lost leadership is still alive until it
/// exits.
async fn livez() -> impl IntoResponse {
    Json(response("ok", None))
}
