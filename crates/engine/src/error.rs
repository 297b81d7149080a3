//! Engine error types and their mapping onto boundary signals.

use coffer_core::FileId;
use coffer_metadata::MetadataError;
use coffer_storage::StorageError;
use http::StatusCode;
use thiserror::Error;

/// Coarse classification callers branch on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The requested file, container or chunk does not exist.
    NotFound,
    /// A duplicate id or an identity collision.
    Conflict,
    /// The underlying chunk or metadata storage failed.
    Io,
    /// An upload was aborted and its partial state cleaned up.
    UploadFailed,
    /// The request itself is malformed or unsatisfiable.
    InvalidRequest,
    /// A broken invariant.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Io => "io_error",
            Self::UploadFailed => "upload_failed",
            Self::InvalidRequest => "invalid_request",
            Self::Internal => "internal_error",
        }
    }
}

/// A file that could not be removed while destroying a container.
#[derive(Debug)]
pub struct DestroyFailure {
    pub file_id: FileId,
    pub error: EngineError,
}

/// Engine operation errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("upload {file_id} failed: {source}")]
    UploadFailed {
        file_id: FileId,
        #[source]
        source: Box<EngineError>,
    },

    #[error("stream for file {file_id} ended after {actual} of {expected} bytes")]
    Truncated {
        file_id: FileId,
        expected: u64,
        actual: u64,
    },

    #[error("failed to delete {} of {attempted} files in container {container}", .failures.len())]
    ContainerDestroy {
        container: String,
        attempted: usize,
        failures: Vec<DestroyFailure>,
    },

    #[error("read error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("{0}")]
    Core(#[from] coffer_core::Error),
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Config(_) | Self::Internal(_) => ErrorKind::Internal,
            Self::UploadFailed { .. } => ErrorKind::UploadFailed,
            Self::Truncated { .. } | Self::Io(_) | Self::ContainerDestroy { .. } => ErrorKind::Io,
            Self::Storage(e) => match e {
                StorageError::NotFound(_) => ErrorKind::NotFound,
                StorageError::Conflict(_) => ErrorKind::Conflict,
                StorageError::Io(_) => ErrorKind::Io,
                StorageError::InvalidKey(_) | StorageError::Config(_) => ErrorKind::Internal,
            },
            Self::Metadata(e) => match e {
                MetadataError::NotFound(_) => ErrorKind::NotFound,
                MetadataError::AlreadyExists(_)
                | MetadataError::Constraint(_)
                | MetadataError::InvalidStateTransition { .. } => ErrorKind::Conflict,
                MetadataError::Database(_) | MetadataError::Timeout(_) => ErrorKind::Io,
                MetadataError::Config(_) | MetadataError::Internal(_) => ErrorKind::Internal,
            },
            Self::Core(e) => match e {
                coffer_core::Error::InvalidState(_) | coffer_core::Error::Serialization(_) => {
                    ErrorKind::Internal
                }
                _ => ErrorKind::InvalidRequest,
            },
        }
    }

    /// Kind of the underlying failure, looking through `UploadFailed`.
    pub fn cause_kind(&self) -> ErrorKind {
        match self {
            Self::UploadFailed { source, .. } => source.cause_kind(),
            other => other.kind(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.cause_kind() == ErrorKind::NotFound
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UploadFailed { source, .. } => source.status_code(),
            Self::Core(coffer_core::Error::RangeNotSatisfiable { .. }) => {
                StatusCode::RANGE_NOT_SATISFIABLE
            }
            other => match other.kind() {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
                ErrorKind::Io | ErrorKind::UploadFailed | ErrorKind::Internal => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}
