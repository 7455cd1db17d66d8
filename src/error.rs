//! Cache Error Types
//!
//! Closed set of terminal codes returned by cache operations.
//! Maps OS errno values onto the taxonomy so filesystem failures surface with a specific variant.

use std::io;

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache operation error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("Access denied")]
    AccessDenied,

    #[error("Entry is in use (dirty or mounted)")]
    InUse,

    #[error("Already exists")]
    AlreadyExists,

    #[error("Not found")]
    NotFound,

    #[error("Too many open files")]
    TooManyOpenFiles,

    #[error("Out of memory")]
    NoMemory,

    #[error("Not enough free disk space")]
    NoSpace,

    #[error("Not a directory")]
    NotADirectory,

    #[error("Operation aborted")]
    Aborted,

    #[error("Operation is invalid for the entry's current state")]
    InvalidOperation,

    #[error("Operation failed")]
    Failed,
}

impl CacheError {
    /// Map cache error to an appropriate libc errno
    pub fn to_errno(&self) -> i32 {
        match self {
            CacheError::AccessDenied => libc::EACCES,
            CacheError::InUse => libc::EBUSY,
            CacheError::AlreadyExists => libc::EEXIST,
            CacheError::NotFound => libc::ENOENT,
            CacheError::TooManyOpenFiles => libc::EMFILE,
            CacheError::NoMemory => libc::ENOMEM,
            CacheError::NoSpace => libc::ENOSPC,
            CacheError::NotADirectory => libc::ENOTDIR,
            CacheError::Aborted => libc::ECANCELED,
            CacheError::InvalidOperation => libc::EINVAL,
            CacheError::Failed => libc::EIO,
        }
    }

    /// Create a CacheError from a raw OS errno
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EACCES | libc::EPERM | libc::EROFS => CacheError::AccessDenied,
            libc::EBUSY | libc::ETXTBSY => CacheError::InUse,
            libc::EEXIST | libc::ENOTEMPTY => CacheError::AlreadyExists,
            libc::ENOENT => CacheError::NotFound,
            libc::EMFILE | libc::ENFILE => CacheError::TooManyOpenFiles,
            libc::ENOMEM => CacheError::NoMemory,
            libc::ENOSPC | libc::EDQUOT => CacheError::NoSpace,
            libc::ENOTDIR => CacheError::NotADirectory,
            libc::ECANCELED | libc::EINTR => CacheError::Aborted,
            _ => CacheError::Failed,
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        if let Some(errno) = err.raw_os_error() {
            return CacheError::from_errno(errno);
        }
        // Errors synthesized by std carry no errno
        match err.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound,
            io::ErrorKind::PermissionDenied => CacheError::AccessDenied,
            io::ErrorKind::AlreadyExists => CacheError::AlreadyExists,
            io::ErrorKind::OutOfMemory => CacheError::NoMemory,
            io::ErrorKind::Interrupted => CacheError::Aborted,
            _ => CacheError::Failed,
        }
    }
}

impl From<nix::errno::Errno> for CacheError {
    fn from(errno: nix::errno::Errno) -> Self {
        CacheError::from_errno(errno as i32)
    }
}
