//! Error types for the workshop server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the workshop server
#[derive(Debug, Error)]
pub enum Error {
    // Lookup errors (2000-2999)
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    // Lifecycle errors (3000-3999)
    #[error("{resource} is not ready (state: {state})")]
    NotReady { resource: String, state: String },

    #[error("Provisioning failed: {0}")]
    ProvisioningFailed(String),

    // Command errors (4000-4999)
    #[error("Command timed out after {0}ms")]
    CommandTimeout(u64),

    #[error("Command failed with exit code {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    #[error("Validation could not be evaluated: {0}")]
    ValidationError(String),

    #[error("Configuration kind {kind} is not supported by the {backend} backend")]
    UnsupportedConfiguration { backend: String, kind: String },

    // Registry errors (5000-5999)
    #[error("Conflicting default cluster: {0}")]
    ConflictingDefault(String),

    #[error("Cluster {cluster_id} is in use by {active} active environment(s)")]
    InUse { cluster_id: String, active: usize },

    // Infrastructure errors (6000-6999)
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Docker error: {0}")]
    DockerError(String),

    #[error("Process error: {0}")]
    ProcessError(String),

    // General errors (1000-1999)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the error code
    pub fn code(&self) -> u32 {
        match self {
            Error::SessionNotFound(_) => 2001,
            Error::EnvironmentNotFound(_) => 2002,
            Error::ClusterNotFound(_) => 2003,
            Error::TemplateNotFound(_) => 2004,
            Error::StepNotFound(_) => 2005,

            Error::NotReady { .. } => 3001,
            Error::ProvisioningFailed(_) => 3002,

            Error::CommandTimeout(_) => 4001,
            Error::CommandFailed { .. } => 4002,
            Error::ValidationError(_) => 4003,
            Error::UnsupportedConfiguration { .. } => 4004,

            Error::ConflictingDefault(_) => 5001,
            Error::InUse { .. } => 5002,

            Error::DatabaseError(_) => 6001,
            Error::DockerError(_) => 6002,
            Error::ProcessError(_) => 6003,

            Error::InvalidRequest(_) => 1001,
            Error::Internal(_) => 1002,
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::SessionNotFound(_)
            | Error::EnvironmentNotFound(_)
            | Error::ClusterNotFound(_)
            | Error::TemplateNotFound(_)
            | Error::StepNotFound(_) => StatusCode::NOT_FOUND,

            Error::NotReady { .. } | Error::ConflictingDefault(_) | Error::InUse { .. } => {
                StatusCode::CONFLICT
            }

            Error::InvalidRequest(_) | Error::UnsupportedConfiguration { .. } => {
                StatusCode::BAD_REQUEST
            }

            Error::CommandFailed { .. } | Error::ValidationError(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }

            Error::CommandTimeout(_) => StatusCode::GATEWAY_TIMEOUT,

            Error::ProvisioningFailed(_) | Error::DockerError(_) | Error::ProcessError(_) => {
                StatusCode::BAD_GATEWAY
            }

            Error::DatabaseError(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for the lookup family of errors
    pub fn is_not_found(&self) -> bool {
        self.status_code() == StatusCode::NOT_FOUND
    }
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Error::DockerError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("Serialization error: {}", err))
    }
}
