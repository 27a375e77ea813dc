//! Error types for the orchestrator

use std::time::Duration;

use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Token error: {0}")]
    TokenError(String),

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("No template for client '{client}' on network '{network}'")]
    UnknownTemplate { network: String, client: String },

    #[error("No inventory hosts target network '{0}'")]
    NoTargets(String),

    #[error("Template error in step '{step}': {message}")]
    Template { step: String, message: String },

    #[error("Duplicate idempotency key for step '{step}' on host '{host}'")]
    DuplicateStep { step: String, host: String },

    #[error("Step timed out after {0:?}")]
    StepTimeout(Duration),

    #[error("Step failed: {0}")]
    StepFailed(String),

    #[error("Deployment state is corrupt ({path}): {message}")]
    StateCorruption { path: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Whether a backend error is worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::StepTimeout(_)
                | OrchestratorError::StepFailed(_)
                | OrchestratorError::HttpError(_)
                | OrchestratorError::WebSocketError(_)
                | OrchestratorError::IoError(_)
        )
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}
