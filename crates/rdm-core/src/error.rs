//! Error types for RDM core

use rdm_types::{ErrorInfo, ErrorKind, TransferStatus};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in RDM core
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Transfer not found: {0}")]
    NotFound(Uuid),

    #[error("Cannot {operation} transfer {id} while it is {status}")]
    InvalidTransition {
        id: Uuid,
        status: TransferStatus,
        operation: &'static str,
    },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("A transfer to this destination already exists: {0}")]
    AlreadyExists(Uuid),

    #[error("Partial file does not match recorded progress: expected {expected} bytes, found {found}")]
    ResumeMismatch { expected: u64, found: u64 },

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Length mismatch: expected {expected} bytes, received {received}")]
    LengthMismatch { expected: u64, received: u64 },

    #[error("Timeout")]
    Timeout,

    #[error("Transfer was cancelled")]
    Cancelled,

    #[error("Transfer was paused")]
    Paused,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Classify the error into the taxonomy reported to listeners
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Network(_)
            | EngineError::ServerError { .. }
            | EngineError::LengthMismatch { .. }
            | EngineError::Timeout => ErrorKind::Network,
            EngineError::Io(_) | EngineError::Database(_) | EngineError::Serialization(_) => {
                ErrorKind::Storage
            }
            EngineError::ResumeMismatch { .. } => ErrorKind::ResumeMismatch,
            EngineError::NotFound(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::InvalidUrl(_)
            | EngineError::InvalidFileName(_)
            | EngineError::AlreadyExists(_)
            | EngineError::Cancelled
            | EngineError::Paused => ErrorKind::InvalidOperation,
        }
    }

    /// Check if the failure happened before any response was received
    pub fn is_connection_error(&self) -> bool {
        match self {
            EngineError::Network(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            EngineError::Timeout => true,
            _ => false,
        }
    }

    /// Details handed to `on_error` listeners
    pub fn to_error_info(&self) -> ErrorInfo {
        let (server_error_message, error_code) = match self {
            EngineError::ServerError { status, message } => (Some(message.clone()), Some(*status)),
            EngineError::Network(e) => (None, e.status().map(|s| s.as_u16())),
            _ => (None, None),
        };

        ErrorInfo {
            kind: self.kind(),
            message: self.to_string(),
            is_server_error: server_error_message.is_some(),
            server_error_message,
            is_connection_error: self.is_connection_error(),
            error_code,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Serialization(error.to_string())
    }
}
