//! Error taxonomy shared by every peerlab component.
//!
//! Component-internal helpers return typed errors; orchestration layers
//! wrap them with [`ResultExt::context`] so the operation and entity id
//! travel with the failure. [`LabError::kind`] always reports the
//! innermost classification regardless of how many contexts were added.

use std::fmt;

use thiserror::Error;

/// Result type alias for orchestration operations.
pub type LabResult<T> = Result<T, LabError>;

/// Classification of a [`LabError`], independent of wrapping context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    FailedPrecondition,
    Unavailable,
    Internal,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::FailedPrecondition => "failed precondition",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by peerlab components.
#[derive(Debug, Error)]
pub enum LabError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A remote node or provider call failed; may be transient.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Store corruption or an unexpected serialization failure.
    #[error("internal: {0}")]
    Internal(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<LabError>,
    },
}

impl LabError {
    /// The innermost error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LabError::NotFound(_) => ErrorKind::NotFound,
            LabError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            LabError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            LabError::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            LabError::Unavailable(_) => ErrorKind::Unavailable,
            LabError::Internal(_) => ErrorKind::Internal,
            LabError::Cancelled => ErrorKind::Cancelled,
            LabError::Context { source, .. } => source.kind(),
        }
    }

    /// Wrap this error with a description of the failing operation.
    pub fn context(self, context: impl Into<String>) -> Self {
        LabError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

/// Adds `.context(..)` to `LabResult`.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> LabResult<T>;

    fn with_context<F, S>(self, f: F) -> LabResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<LabError>> ResultExt<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> LabResult<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F, S>(self, f: F) -> LabResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}
