//! Crate-wide error types and POSIX error-code mapping.
//!
//! Component errors (`BackendError`, `DatabaseError`, `CacheError`) convert
//! into `FsError`, which the FUSE adaptation layer turns into an errno via
//! [`FsError::errno`]. `Quiet` errors carry a message that front-ends print
//! without a backtrace.

use thiserror::Error;

use crate::backend::BackendError;
use crate::database::DatabaseError;

/// POSIX error numbers used by the file-system surface.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EACCES: i32 = 13;
    pub const EEXIST: i32 = 17;
    pub const ENOTDIR: i32 = 20;
    pub const EISDIR: i32 = 21;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const ENOTEMPTY: i32 = 39;
    pub const ENODATA: i32 = 61;
}

/// Top-level error of file-system operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such entry")]
    NotFound,

    #[error("entry already exists")]
    Exists,

    #[error("is a directory")]
    IsDirectory,

    #[error("not a directory")]
    NotDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("operation not permitted")]
    PermissionDenied,

    #[error("access denied")]
    AccessDenied,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("no such attribute")]
    NoAttribute,

    #[error("out of inodes")]
    OutOfInodes,

    /// A data object expected to exist could not be retrieved, or its
    /// payload failed integrity checks. The file system has been marked
    /// damaged.
    #[error("lost block {blockno} of inode {inode}: {reason}")]
    LostBlock {
        inode: i64,
        blockno: u64,
        reason: String,
    },

    #[error("input/output error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// User-facing misuse (missing file system, bad passphrase, ...).
    /// Front-ends print the message only, no stack trace.
    #[error("{0}")]
    Quiet(String),
}

impl FsError {
    /// Map this error to the errno returned to the kernel.
    pub fn errno(&self) -> i32 {
        use errno::*;
        match self {
            FsError::NotFound => ENOENT,
            FsError::Exists => EEXIST,
            FsError::IsDirectory => EISDIR,
            FsError::NotDirectory => ENOTDIR,
            FsError::NotEmpty => ENOTEMPTY,
            FsError::PermissionDenied => EPERM,
            FsError::AccessDenied => EACCES,
            FsError::InvalidArgument => EINVAL,
            FsError::NoAttribute => ENODATA,
            FsError::OutOfInodes => ENOSPC,
            FsError::LostBlock { .. } => EIO,
            FsError::Io(_) => EIO,
            FsError::Database(_) => EIO,
            FsError::Backend(_) => EIO,
            FsError::Quiet(_) => EIO,
        }
    }

    /// Shorthand for a quiet, message-only error.
    pub fn quiet(msg: impl Into<String>) -> Self {
        FsError::Quiet(msg.into())
    }
}

impl From<sqlx::Error> for FsError {
    fn from(err: sqlx::Error) -> Self {
        FsError::Database(err.into())
    }
}

/// Result alias for file-system operations.
pub type FsResult<T> = Result<T, FsError>;
