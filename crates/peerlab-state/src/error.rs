//! Error types for the peerlab metadata store.

use peerlab_core::LabError;
use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),
}

impl From<StateError> for LabError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(what) => LabError::NotFound(what),
            StateError::AlreadyExists(what) => LabError::AlreadyExists(what),
            StateError::InvalidKey(what) => LabError::InvalidArgument(what),
            other => LabError::Internal(other.to_string()),
        }
    }
}
