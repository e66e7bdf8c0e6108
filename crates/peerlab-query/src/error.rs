//! Query parse errors.

use thiserror::Error;

/// A query failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("syntax error at position {position}: {message}")]
pub struct SyntaxError {
    /// Byte offset of the offending input.
    pub position: usize,
    pub message: String,
}

impl SyntaxError {
    pub(crate) fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

impl From<SyntaxError> for peerlab_core::LabError {
    fn from(err: SyntaxError) -> Self {
        peerlab_core::LabError::InvalidArgument(err.to_string())
    }
}
