//! Store error types.

use std::io;
use thiserror::Error;

/// Store error type.
///
/// Every variant that concerns a single entry carries the logical path
/// that caused it, so messages surfaced to callers always name the path.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No physical backing and no origin could supply one.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Filesystem is read-only.
    #[error("filesystem is read-only")]
    ReadOnly,

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Mapped location falls outside the store's base directory.
    #[error("path escapes root: {0}")]
    PathEscapesRoot(String),

    /// Path text is not acceptable (embedded NUL and the like).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Operands that cannot be combined.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Remote origin reported a failure.
    #[error("remote failure for {path}: {message}")]
    Remote { path: String, message: String },

    /// Unknown layout or wrapper, missing or malformed key.
    #[error("configuration error: {0}")]
    Config(String),

    /// Synchronizer wait was cut short by shutdown.
    #[error("interrupted while waiting on {0}")]
    Interrupted(String),

    /// Store or handle already closed.
    #[error("closed: {0}")]
    Closed(String),

    /// Physical I/O failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a PathEscapesRoot error.
    pub fn path_escapes_root(path: impl Into<String>) -> Self {
        Self::PathEscapesRoot(path.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a Remote error.
    pub fn remote(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a Config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an Interrupted error.
    pub fn interrupted(key: impl Into<String>) -> Self {
        Self::Interrupted(key.into())
    }

    /// Create a Closed error.
    pub fn closed(what: impl Into<String>) -> Self {
        Self::Closed(what.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Wrap an I/O error for `path`.
    ///
    /// `NotFound` and `AlreadyExists` kinds are lifted into their own
    /// variants so callers can match on them without digging into `source`.
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(path),
            io::ErrorKind::DirectoryNotEmpty => Self::DirectoryNotEmpty(path),
            io::ErrorKind::IsADirectory => Self::IsADirectory(path),
            io::ErrorKind::NotADirectory => Self::NotADirectory(path),
            _ => Self::Io { path, source },
        }
    }

    /// Returns true for the not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Convert StoreError to std::io::Error for compatibility.
impl From<StoreError> for io::Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            StoreError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            StoreError::ReadOnly => {
                io::Error::new(io::ErrorKind::PermissionDenied, "filesystem is read-only")
            }
            StoreError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            StoreError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            StoreError::DirectoryNotEmpty(msg) => {
                io::Error::new(io::ErrorKind::DirectoryNotEmpty, msg)
            }
            StoreError::PathEscapesRoot(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            StoreError::InvalidPath(msg) | StoreError::InvalidArgument(msg) => {
                io::Error::new(io::ErrorKind::InvalidInput, msg)
            }
            StoreError::Interrupted(msg) => io::Error::new(io::ErrorKind::Interrupted, msg),
            StoreError::Io { source, .. } => source,
            other => io::Error::other(other.to_string()),
        }
    }
}

/// Store result type.
pub type StoreResult<T> = Result<T, StoreError>;
