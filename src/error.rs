//! Error types for stackfs

use nix::errno::Errno;
use thiserror::Error;

/// Result type alias for stackfs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the stacking layer
#[derive(Error, Debug)]
pub enum Error {
    /// Namespace invariant violated (self-ancestor rename, bad flag combination)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Post-lock validation found the entry moved or detached
    #[error("Race detected: {0}")]
    RaceDetected(String),

    /// Rename target is an ancestor of the source
    #[error("Directory not empty")]
    DirectoryNotEmpty,

    /// Missing lower capability, unsupported flag or operation on the wrong object kind
    #[error("Operation not supported: {0}")]
    UnsupportedOperation(String),

    /// Shadow object construction failed
    #[error("Allocation failed: {0}")]
    AllocationError(String),

    /// A positive lower object was required but resolution was negative
    #[error("Stale reference: {0}")]
    StaleReference(String),

    /// Error reported by the lower filesystem, forwarded verbatim
    #[error("Lower filesystem error: {0}")]
    Lower(Errno),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// POSIX errno reported to the hosting framework
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) | Error::RaceDetected(_) => libc::EINVAL,
            Error::DirectoryNotEmpty => libc::ENOTEMPTY,
            Error::UnsupportedOperation(_) => libc::EOPNOTSUPP,
            Error::AllocationError(_) => libc::ENOMEM,
            Error::StaleReference(_) => libc::ESTALE,
            Error::Lower(errno) => *errno as i32,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Config(_)
            | Error::InvalidConfig(_)
            | Error::Serialization(_)
            | Error::Internal(_) => libc::EIO,
        }
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::Lower(errno)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::RaceDetected("x".into()).errno(), libc::EINVAL);
        assert_eq!(Error::DirectoryNotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(
            Error::UnsupportedOperation("xattr".into()).errno(),
            libc::EOPNOTSUPP
        );
        assert_eq!(Error::StaleReference("f".into()).errno(), libc::ESTALE);
        assert_eq!(Error::Lower(Errno::EBUSY).errno(), libc::EBUSY);
    }

    #[test]
    fn test_lower_errors_forwarded() {
        let err: Error = Errno::EEXIST.into();
        assert!(matches!(err, Error::Lower(Errno::EEXIST)));
        assert_eq!(err.errno(), libc::EEXIST);
    }
}
