//! Sandbox pipeline error types and classification helpers

use crate::provider::ProviderError;
use axum::http::StatusCode;
use std::fmt;
use std::time::Duration;

/// Stable failure taxonomy surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    SecurityViolation,
    BuildFailed,
    ServerTimeout,
    StagingFailed,
    ProviderError,
    Unclassified,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "Invalid_Input",
            ErrorKind::SecurityViolation => "Security_Violation",
            ErrorKind::BuildFailed => "Build_Failed",
            ErrorKind::ServerTimeout => "Server_Timeout",
            ErrorKind::StagingFailed => "Staging_Failed",
            ErrorKind::ProviderError => "Provider_Error",
            ErrorKind::Unclassified => "Internal_Error",
        }
    }

    /// HTTP status class for this kind of failure
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::InvalidInput | ErrorKind::SecurityViolation => StatusCode::BAD_REQUEST,
            ErrorKind::BuildFailed => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::ServerTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::StagingFailed | ErrorKind::ProviderError => StatusCode::BAD_GATEWAY,
            ErrorKind::Unclassified => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for sandbox orchestration
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Malformed, oversized or too-many-files request
    #[error("Invalid_Input: {0}")]
    InvalidInput(String),
    /// Path traversal or absolute-path entries
    #[error("Security_Violation: {0}")]
    SecurityViolation(String),
    /// Dependency install exited non-zero or never finished
    #[error("Build_Failed: {message}")]
    BuildFailed {
        message: String,
        exit_code: Option<i32>,
        stdout: String,
    },
    /// No candidate port resolved a public domain within the readiness window
    #[error("Server_Timeout: {0}")]
    ServerTimeout(String),
    /// Upload of the project files into the environment failed
    #[error("Staging_Failed: {0}")]
    StagingFailed(#[source] ProviderError),
    /// Environment creation or any provider transport failure
    #[error("Provider_Error: {0}")]
    Provider(#[source] ProviderError),
    /// Anything the pipeline did not anticipate
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::InvalidInput(_) => ErrorKind::InvalidInput,
            SandboxError::SecurityViolation(_) => ErrorKind::SecurityViolation,
            SandboxError::BuildFailed { .. } => ErrorKind::BuildFailed,
            SandboxError::ServerTimeout(_) => ErrorKind::ServerTimeout,
            SandboxError::StagingFailed(_) => ErrorKind::StagingFailed,
            SandboxError::Provider(_) => ErrorKind::ProviderError,
            SandboxError::Other(_) => ErrorKind::Unclassified,
        }
    }

    /// Caller-facing message. Unclassified errors are replaced by a generic
    /// phrase when `redact` is set; classified kinds always keep their detail.
    pub fn public_message(&self, redact: bool) -> String {
        if redact && self.kind() == ErrorKind::Unclassified {
            return "An unexpected server error occurred".to_string();
        }
        self.to_string()
    }
}

impl From<ProviderError> for SandboxError {
    fn from(err: ProviderError) -> Self {
        SandboxError::Provider(err)
    }
}

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;

/// Backoff configuration for polling remote state
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Calculates exponential backoff with jitter
pub fn calculate_backoff(attempt: u32, config: &BackoffConfig) -> Duration {
    let backoff = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powi(attempt as i32))
    .min(config.max_backoff_ms as f64) as u64;

    // Add jitter: ±20% of backoff
    let jitter = (backoff as f64) * (rand::random::<f64>() * 0.4 - 0.2);
    let millis = ((backoff as f64) + jitter).max(0.0) as u64;
    Duration::from_millis(millis.min(config.max_backoff_ms))
}
