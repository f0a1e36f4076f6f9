//! Errno-shaped errors for the POSIX-like surface.
//!
//! Mount bridges translate these one-to-one into OS error numbers, so the
//! variants mirror errno names rather than the backend taxonomy. Backend
//! failures crossing the boundary are wrapped in [`VfsError::Fs`].

use thiserror::Error;

use flotilla_core::error::FsError;

pub type VfsResult<T> = Result<T, VfsError>;

/// Failures surfaced by VFS operations.
#[derive(Debug, Error)]
pub enum VfsError {
    /// EINVAL - invalid flag combination or argument.
    #[error("invalid argument")]
    Einval,

    /// ENOENT - no such file or directory.
    #[error("no such file or directory")]
    Enoent,

    /// EEXIST - file exists.
    #[error("file exists")]
    Eexist,

    /// EBADF - operation not permitted on this handle.
    #[error("bad file descriptor")]
    Ebadf,

    /// EISDIR - the path names a directory.
    #[error("is a directory")]
    Eisdir,

    /// ENOTDIR - a path component is not a directory.
    #[error("not a directory")]
    Enotdir,

    /// ENOTEMPTY - directory not empty.
    #[error("directory not empty")]
    Enotempty,

    /// ENOSYS - the operation needs a cache mode this VFS was not given.
    #[error("operation requires a file cache")]
    Enosys,

    /// EROFS - the VFS was mounted read-only.
    #[error("read-only file system")]
    Erofs,

    /// A read or write on a handle that has been closed.
    #[error("file already closed")]
    FileClosed,

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VfsError {
    /// Collapse backend not-found errors into ENOENT at the boundary.
    pub fn from_backend(err: FsError) -> VfsError {
        match err {
            FsError::ObjectNotFound(_) | FsError::DirNotFound(_) => VfsError::Enoent,
            FsError::NotAFile(_) => VfsError::Eisdir,
            FsError::DirectoryNotEmpty(_) => VfsError::Enotempty,
            other => VfsError::Fs(other),
        }
    }
}
