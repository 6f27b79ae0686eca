use std::path::PathBuf;

use crate::model::{OperationId, OperationType};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("crypto error")]
    Crypto,

    #[error("remote error: {message}")]
    Remote { message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("crate not found: {crate_id}")]
    MissingCrate { crate_id: uuid::Uuid },

    #[error("metadata not found for entity: {path:?}")]
    MissingMetadata { path: PathBuf },

    #[error("integrity error: {message}")]
    Integrity { message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("operation already active: {operation} ({kind})")]
    OperationAlreadyActive {
        operation: OperationId,
        kind: OperationType,
    },

    #[error("operation not found: {operation}")]
    OperationNotFound { operation: OperationId },

    #[error("operation already completed: {operation}")]
    OperationAlreadyCompleted { operation: OperationId },

    #[error("unsupported operation: {kind}")]
    UnsupportedOperation { kind: OperationType },

    #[error("unsupported path (must be UTF-8): {path:?}")]
    NonUtf8Path { path: PathBuf },
}

impl Error {
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Whether this failure aborts the whole operation instead of only the
    /// entity that raised it.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Io(_)
                | Self::Walkdir(_)
                | Self::Integrity { .. }
                | Self::MissingMetadata { .. }
                | Self::NonUtf8Path { .. }
        )
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(inner) => inner,
            other => std::io::Error::other(other),
        }
    }
}
