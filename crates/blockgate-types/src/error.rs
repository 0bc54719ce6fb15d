//! Gateway error kinds and their errno mapping.

use thiserror::Error;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway operation errors.
///
/// Every failure that crosses a component boundary is one of these kinds.
/// The filesystem surface reports them as errno values via [`Error::errno`];
/// nothing is retried locally.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Malformed input: bad cfgstring, bad block size, range wrap.
    #[error("invalid: {0}")]
    Invalid(String),
    /// Reference to an unknown minor or unknown node.
    #[error("no such device: {0}")]
    NoDevice(String),
    /// Feature not implemented by the backend, or no backend for a subtype.
    #[error("not supported: {0}")]
    NoEnt(String),
    /// Resource in use: non-empty directory, held node, bound backend.
    #[error("busy: {0}")]
    Busy(String),
    /// Duplicate name or subtype.
    #[error("already exists: {0}")]
    Exists(String),
    /// Fixed-capacity table exhausted.
    #[error("no space: {0}")]
    NoSpace(String),
    #[error("is a directory: {0}")]
    IsDirectory(String),
    #[error("not a directory: {0}")]
    NotDirectory(String),
    /// Directory still has children.
    #[error("not empty: {0}")]
    NotEmpty(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Non-OK status surfaced from a backend.
    #[error("io error: {0}")]
    Io(String),
    /// Dynamic loader or entry-point resolution failure.
    #[error("bad module: {0}")]
    BadFile(String),
}

impl Error {
    /// The positive errno corresponding to this error kind.
    ///
    /// The FUSE reply path wants positive errno values; callers following
    /// the C convention negate this.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Invalid(_) => 22,      // EINVAL
            Error::NoDevice(_) => 19,     // ENODEV
            Error::NoEnt(_) => 6,         // ENXIO
            Error::Busy(_) => 16,         // EBUSY
            Error::Exists(_) => 17,       // EEXIST
            Error::NoSpace(_) => 28,      // ENOSPC
            Error::IsDirectory(_) => 21,  // EISDIR
            Error::NotDirectory(_) => 20, // ENOTDIR
            Error::NotEmpty(_) => 39,     // ENOTEMPTY
            Error::NotFound(_) => 2,      // ENOENT
            Error::Io(_) => 5,            // EIO
            Error::BadFile(_) => 9,       // EBADF
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => Error::NotFound(err.to_string()),
            ErrorKind::AlreadyExists => Error::Exists(err.to_string()),
            ErrorKind::IsADirectory => Error::IsDirectory(err.to_string()),
            ErrorKind::NotADirectory => Error::NotDirectory(err.to_string()),
            ErrorKind::DirectoryNotEmpty => Error::NotEmpty(err.to_string()),
            _ => Error::Io(err.to_string()),
        }
    }
}
