//! Error types for the instance agent

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cohost_probe::{ContentionError, ProbeError};
use serde_json::json;
use tracing::warn;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Contention setup failed: {0}")]
    Contention(#[from] ContentionError),

    #[error("Probe setup failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Core error: {0}")]
    Core(#[from] cohost_core::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Stable category reported in error bodies
    pub fn category(&self) -> &'static str {
        match self {
            AgentError::Contention(ContentionError::InvalidConfiguration(_)) => "invalid_request",
            AgentError::Contention(_) => "contention_setup",
            AgentError::Probe(_) => "probe_setup",
            AgentError::InvalidRequest(_) => "invalid_request",
            AgentError::Configuration(_) => "configuration",
            AgentError::Metrics(_) => "metrics",
            AgentError::Io(_) => "io",
            AgentError::Core(e) => e.category(),
            AgentError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AgentError::InvalidRequest(_)
            | AgentError::Contention(ContentionError::InvalidConfiguration(_)) => {
                StatusCode::BAD_REQUEST
            }
            AgentError::Core(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        }

        let body = Json(json!({
            "error": self.to_string(),
            "category": self.category(),
        }));
        (status, body).into_response()
    }
}
