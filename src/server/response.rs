use crate::error::SandboxError;
use crate::orchestrator::LaunchOutcome;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::any::Any;
use tracing::{error, warn};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxResponse {
    pub success: bool,
    pub preview_url: String,
    pub sandbox_id: String,
    pub output: String,
    /// Whether the liveness probe got an answer before the URL was returned
    pub verified: bool,
    /// Sent back in `x-release-token` to tear the sandbox down early
    pub release_token: String,
}

impl From<LaunchOutcome> for CreateSandboxResponse {
    fn from(outcome: LaunchOutcome) -> Self {
        Self {
            success: true,
            preview_url: outcome
                .preview_url()
                .as_str()
                .trim_end_matches('/')
                .to_string(),
            verified: outcome.readiness.is_verified(),
            sandbox_id: outcome.environment_id,
            output: outcome.install_output,
            release_token: outcome.release_token,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: String,
}

impl ErrorEnvelope {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

/// A pipeline error on its way out of a handler
#[derive(Debug)]
pub struct ApiError {
    pub error: SandboxError,
    pub redact: bool,
}

impl ApiError {
    pub fn new(error: SandboxError, redact: bool) -> Self {
        Self { error, redact }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.error.kind();
        let status = kind.status();

        if status.is_server_error() {
            error!(kind = %kind, status = status.as_u16(), "Server error: {}", self.error);
        } else {
            warn!(kind = %kind, status = status.as_u16(), "Client error: {}", self.error);
        }

        let body = ErrorEnvelope::new(self.error.public_message(self.redact));
        (status, Json(body)).into_response()
    }
}

/// Turns a handler panic into the same 500 envelope as any unclassified error
pub fn panic_response(panic: Box<dyn Any + Send + 'static>, redact: bool) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };

    let error = SandboxError::Other(anyhow::anyhow!("handler panicked: {}", detail));
    ApiError::new(error, redact).into_response()
}

pub fn too_many_requests() -> (StatusCode, Json<ErrorEnvelope>) {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ErrorEnvelope::new(
            "Too many requests, please try again later.",
        )),
    )
}
