//! Error types for fwconductor

use serde_json::Value;
use thiserror::Error;

use crate::workflow::condition::ConditionError;

/// Errors raised while talking to a device's management endpoint
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Network reset/refused/timeout, 5xx, or 404 on an endpoint expected to exist
    #[error("Transient failure: {reason}")]
    Transient { reason: String, status: Option<u16> },

    /// Permanent HTTP rejection; carries the original status and body
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Action not advertised by device: {0}")]
    ProtocolUnsupported(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Deadline elapsed: {0}")]
    Timeout(String),

    #[error("Job failed with state {state}")]
    JobFailed { state: String, document: Value },

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ProtocolError>,
    },

    #[error("Payload error: {0}")]
    Payload(String),

    #[error("Invalid update request: {0}")]
    Validation(String),

    #[error("Transport configuration error: {0}")]
    Transport(String),
}

impl ProtocolError {
    /// Whether the retry policy may attempt the call again
    pub fn is_transient(&self) -> bool {
        matches!(self, ProtocolError::Transient { .. })
    }

    /// HTTP status attached to the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ProtocolError::Transient { status, .. } => *status,
            ProtocolError::Http { status, .. } => Some(*status),
            ProtocolError::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    /// Classify a status code returned by an endpoint that is expected to exist
    pub fn from_status(status: u16, body: String) -> Self {
        if status == 404 || status >= 500 {
            ProtocolError::Transient {
                reason: format!("HTTP {}: {}", status, body),
                status: Some(status),
            }
        } else if status == 401 {
            ProtocolError::Authentication(body)
        } else {
            ProtocolError::Http { status, body }
        }
    }
}

impl From<reqwest::Error> for ProtocolError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            return ProtocolError::Transport(err.to_string());
        }
        if err.is_decode() {
            return ProtocolError::MalformedResponse(err.to_string());
        }
        // connect, timeout, request and body errors are network-level
        ProtocolError::Transient {
            reason: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
        }
    }
}

/// Main error type for fwconductor
#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Condition error: {0}")]
    Condition(#[from] ConditionError),

    #[error("Workflow error: {0}")]
    WorkflowError(String),

    #[error("Safety check failed: {0}")]
    CheckFailed(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for ConductorError {
    fn from(err: anyhow::Error) -> Self {
        ConductorError::Internal(err.to_string())
    }
}
