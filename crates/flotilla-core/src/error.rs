//! The error taxonomy shared by every backend and engine layer.
//!
//! Errors are classified along three orthogonal axes: a [`kind`](FsError::kind)
//! (what went wrong), retryability (whether the pacer should try again), and
//! severity (whether all work must stop). Exit codes for tool embeddings map
//! off the same classification.

use std::time::Duration;

use thiserror::Error;

use flotilla_hash::HashError;

/// Result alias used across the workspace.
pub type FsResult<T> = Result<T, FsError>;

/// Process exit codes surfaced by embedding tools.
pub mod exitcode {
    /// Everything worked.
    pub const SUCCESS: i32 = 0;
    /// An error not covered by a more specific code.
    pub const UNCATEGORIZED: i32 = 1;
    /// Invalid arguments or usage.
    pub const USAGE: i32 = 2;
    /// Source or destination directory was not found.
    pub const DIR_NOT_FOUND: i32 = 3;
    /// Source or destination file was not found.
    pub const FILE_NOT_FOUND: i32 = 4;
    /// A temporary failure persisted past the retry budget.
    pub const RETRY_ERROR: i32 = 5;
    /// A non-retryable but non-fatal failure.
    pub const NO_RETRY_ERROR: i32 = 6;
    /// A fatal failure stopped all work.
    pub const FATAL_ERROR: i32 = 7;
    /// The configured transfer limit was exceeded.
    pub const TRANSFER_EXCEEDED: i32 = 8;
    /// No files were transferred and the caller asked to treat that as an
    /// error.
    pub const NO_FILES_TRANSFERRED: i32 = 9;
}

/// Coarse classification of an [`FsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Transient,
    FatalBackend,
    QuotaExceeded,
    Cancelled,
    Validation,
    Unsupported,
    Other,
}

/// Every failure a backend or engine layer can surface.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("directory not found: {0}")]
    DirNotFound(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// The supplied root resolved to a file rather than a directory.
    /// `Registry::new_fs` converts this into a distinct result variant;
    /// backends use it only to signal the probe.
    #[error("is a file not a directory: {0}")]
    IsFile(String),

    #[error("is a directory not a file: {0}")]
    NotAFile(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Bucket-based remotes cannot list their root without a bucket name.
    #[error("bucket or container name required in {0}")]
    ListBucketRequired(String),

    #[error("server-side copy not available")]
    CantCopy,

    #[error("server-side move not available")]
    CantMove,

    #[error("server-side directory move not available")]
    CantDirMove,

    #[error("backend cannot set modification time")]
    CantSetModTime,

    #[error("max transfer limit reached")]
    MaxTransferLimitReached,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("file name too long: {0}")]
    FileNameTooLong(String),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("operation cancelled")]
    Cancelled,

    /// A transient failure the pacer may retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The backend throttled the caller; `retry_after` carries a
    /// server-provided hint when one was present.
    #[error("throttled: {message}")]
    Throttled {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A structural backend failure; all work must stop.
    #[error("fatal backend failure: {0}")]
    Fatal(String),

    #[error("invalid argument: {0}")]
    Validation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Hash(#[from] HashError),
}

impl FsError {
    /// The coarse kind of this error.
    pub fn kind(&self) -> ErrorKind {
        use FsError::*;
        match self {
            DirNotFound(_) | ObjectNotFound(_) => ErrorKind::NotFound,
            AlreadyExists(_) => ErrorKind::AlreadyExists,
            PermissionDenied(_) => ErrorKind::PermissionDenied,
            Transient(_) | Throttled { .. } => ErrorKind::Transient,
            Fatal(_) => ErrorKind::FatalBackend,
            QuotaExceeded(_) | MaxTransferLimitReached => ErrorKind::QuotaExceeded,
            Cancelled => ErrorKind::Cancelled,
            Validation(_) | IsFile(_) | NotAFile(_) | FileNameTooLong(_)
            | ListBucketRequired(_) => ErrorKind::Validation,
            NotSupported(_) | CantCopy | CantMove | CantDirMove | CantSetModTime => {
                ErrorKind::Unsupported
            }
            Io(err) => match err.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
                k if io_kind_transient(k) => ErrorKind::Transient,
                _ => ErrorKind::Other,
            },
            DirectoryNotEmpty(_) | Hash(_) => ErrorKind::Other,
        }
    }

    /// Whether the pacer should retry the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Whether this failure must stop all work in the pool.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FsError::Fatal(_) | FsError::MaxTransferLimitReached | FsError::QuotaExceeded(_)
        )
    }

    /// A server-provided backoff hint, if the failure carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FsError::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// The exit code an embedding tool should report for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            FsError::DirNotFound(_) => exitcode::DIR_NOT_FOUND,
            FsError::ObjectNotFound(_) => exitcode::FILE_NOT_FOUND,
            FsError::MaxTransferLimitReached => exitcode::TRANSFER_EXCEEDED,
            FsError::Validation(_) => exitcode::USAGE,
            _ if self.is_fatal() => exitcode::FATAL_ERROR,
            _ if self.is_retryable() => exitcode::RETRY_ERROR,
            FsError::Io(_) => exitcode::UNCATEGORIZED,
            _ => exitcode::NO_RETRY_ERROR,
        }
    }
}

impl Clone for FsError {
    fn clone(&self) -> Self {
        use FsError::*;
        match self {
            DirNotFound(s) => DirNotFound(s.clone()),
            ObjectNotFound(s) => ObjectNotFound(s.clone()),
            IsFile(s) => IsFile(s.clone()),
            NotAFile(s) => NotAFile(s.clone()),
            DirectoryNotEmpty(s) => DirectoryNotEmpty(s.clone()),
            ListBucketRequired(s) => ListBucketRequired(s.clone()),
            CantCopy => CantCopy,
            CantMove => CantMove,
            CantDirMove => CantDirMove,
            CantSetModTime => CantSetModTime,
            MaxTransferLimitReached => MaxTransferLimitReached,
            PermissionDenied(s) => PermissionDenied(s.clone()),
            FileNameTooLong(s) => FileNameTooLong(s.clone()),
            AlreadyExists(s) => AlreadyExists(s.clone()),
            NotSupported(s) => NotSupported(s),
            Cancelled => Cancelled,
            Transient(s) => Transient(s.clone()),
            Throttled {
                message,
                retry_after,
            } => Throttled {
                message: message.clone(),
                retry_after: *retry_after,
            },
            QuotaExceeded(s) => QuotaExceeded(s.clone()),
            Fatal(s) => Fatal(s.clone()),
            Validation(s) => Validation(s.clone()),
            Io(err) => Io(std::io::Error::new(err.kind(), err.to_string())),
            Hash(e) => Hash(e.clone()),
        }
    }
}

/// Transient I/O error kinds: interrupted syscalls and dropped connections.
fn io_kind_transient(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        kind,
        Interrupted | TimedOut | ConnectionReset | ConnectionAborted | BrokenPipe | WouldBlock
    )
}
