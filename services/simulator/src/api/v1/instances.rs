//! Instance API endpoints.
//!
//! Thin JSON wrapper over the simulated provider. Terminating or tagging an
//! instance that is already gone is a successful response carrying the
//! reason, not an error.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use fleetsim_id::{InstanceId, NodeId};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::catalog::InstanceType;
use crate::instance::SimulatedInstance;
use crate::provider::{GoneReason, LaunchSpec, ProviderError, TagResult, TerminateOutcome};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_instances).post(launch_instance))
        .route("/{instance_id}", get(get_instance).delete(terminate_instance))
        .route("/{instance_id}/tags", put(tag_instance))
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Request to launch an instance.
///
/// `instance_type` is shorthand for a single-entry `instance_types`.
#[derive(Debug, Deserialize)]
pub struct LaunchInstanceRequest {
    #[serde(default)]
    pub instance_type: Option<String>,
    /// Acceptable types in preference order.
    #[serde(default)]
    pub instance_types: Vec<String>,
    #[serde(default)]
    pub node_id: Option<NodeId>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl LaunchInstanceRequest {
    fn into_spec(self) -> LaunchSpec {
        let mut instance_types = self.instance_types;
        if let Some(first) = self.instance_type {
            instance_types.insert(0, first);
        }
        LaunchSpec {
            instance_types,
            node: self.node_id,
            tags: self.tags,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TagInstanceRequest {
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct ListInstancesResponse {
    pub items: Vec<SimulatedInstance>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ListInstanceTypesResponse {
    pub items: Vec<InstanceType>,
}

/// Result of a terminate or tag request.
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MutationResponse {
    Terminated { instance: SimulatedInstance },
    Tagged { instance: SimulatedInstance },
    AlreadyGone { reason: GoneReason },
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /v1/instances
async fn launch_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<LaunchInstanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let spec = req.into_spec();
    let instance = state
        .provider()
        .launch(spec)
        .await
        .map_err(|e| provider_error(e, &ctx))?;

    Ok((StatusCode::CREATED, Json(instance)))
}

/// GET /v1/instances
async fn list_instances(State(state): State<AppState>) -> impl IntoResponse {
    let items = state.provider().list().await;
    let total = items.len();
    Json(ListInstancesResponse { items, total })
}

/// GET /v1/instances/{instance_id}
async fn get_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&instance_id, &ctx)?;

    match state.provider().describe(instance_id).await {
        Some(instance) => Ok(Json(instance)),
        None => Err(ApiError::not_found(
            "instance_not_found",
            format!("Instance {instance_id} not found"),
        )
        .with_request_id(ctx.request_id)),
    }
}

/// DELETE /v1/instances/{instance_id}
async fn terminate_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&instance_id, &ctx)?;

    let outcome = state
        .provider()
        .terminate(instance_id)
        .await
        .map_err(|e| provider_error(e, &ctx))?;

    Ok(Json(match outcome {
        TerminateOutcome::Terminated(instance) => MutationResponse::Terminated { instance },
        TerminateOutcome::AlreadyGone(reason) => MutationResponse::AlreadyGone { reason },
    }))
}

/// PUT /v1/instances/{instance_id}/tags
async fn tag_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<String>,
    Json(req): Json<TagInstanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&instance_id, &ctx)?;

    let result = state
        .provider()
        .tag(instance_id, req.tags)
        .await
        .map_err(|e| provider_error(e, &ctx))?;

    Ok(Json(match result {
        TagResult::Tagged(instance) => MutationResponse::Tagged { instance },
        TagResult::AlreadyGone(reason) => MutationResponse::AlreadyGone { reason },
    }))
}

/// GET /v1/instance-types
pub async fn list_instance_types(State(state): State<AppState>) -> impl IntoResponse {
    Json(ListInstanceTypesResponse {
        items: state.provider().instance_types(),
    })
}

fn parse_instance_id(raw: &str, ctx: &RequestContext) -> Result<InstanceId, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::bad_request("invalid_instance_id", "Invalid instance ID format")
            .with_request_id(ctx.request_id.clone())
    })
}

fn provider_error(err: ProviderError, ctx: &RequestContext) -> ApiError {
    match &err {
        ProviderError::LaunchFailed { .. } => {
            tracing::warn!(error = %err, request_id = %ctx.request_id, "Launch failed");
        }
        _ => {
            tracing::debug!(error = %err, request_id = %ctx.request_id, "Provider rejected request");
        }
    }
    ApiError::from(err).with_request_id(ctx.request_id.clone())
}
