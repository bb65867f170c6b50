//! Error type for the agent binary and library.

use telemetry_core::{DeclarationError, TelemetryError};

/// All errors the agent surfaces to its caller.
#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Declaration error: {0}")]
    Declaration(#[from] DeclarationError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type AgentResult<T> = Result<T, AgentError>;
