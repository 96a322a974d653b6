use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::provider::ProviderError;

/// RFC 7807 problem document.
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
    pub retry_after_seconds: u32,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://fleetsim.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
            retry_after_seconds: 0,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }

    fn set_retry_after_seconds(&mut self, seconds: u32) {
        self.retry_after_seconds = seconds;
        if seconds > 0 {
            self.retryable = true;
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_GATEWAY, code, message)
    }

    /// This replica does not hold leadership; another one might.
    pub fn not_leader() -> Self {
        Self::with_status(
            StatusCode::SERVICE_UNAVAILABLE,
            "not_leader",
            "This replica is not the leader; retry against the current leader",
        )
        .with_retry_after_seconds(1)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }

    pub fn with_retry_after_seconds(mut self, seconds: u32) -> Self {
        self.problem.set_retry_after_seconds(seconds);
        self
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        match &err {
            ProviderError::NotLeader => ApiError::not_leader(),
            ProviderError::InvalidSpec(_) => ApiError::bad_request("invalid_launch_spec", err.to_string()),
            ProviderError::InsufficientCapacity { .. } => {
                ApiError::conflict("insufficient_capacity", err.to_string())
                    .with_retry_after_seconds(5)
            }
            ProviderError::LaunchFailed { .. } => {
                ApiError::bad_gateway("launch_failed", err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
