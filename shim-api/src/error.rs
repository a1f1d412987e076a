//! Error handling for the shim
//!
//! Every fallible shim operation reports one of these variants. Each maps to
//! exactly one errno value so the C exports can hand it back unchanged.

use core::fmt;
use std::io;

/// Error returned by shim operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyscallError {
    /// Invalid arguments (EINVAL)
    InvalidArgument,
    /// Descriptor is not open (EBADF)
    BadDescriptor,
    /// Bad user pointer (EFAULT)
    BadAddress,
    /// Registration already present (EEXIST)
    AlreadyExists,
    /// Registration missing (ENOENT)
    NotFound,
    /// Descriptor kind cannot be watched (EPERM)
    PermissionDenied,
    /// Out of memory (ENOMEM)
    OutOfMemory,
    /// Descriptor limit reached (EMFILE)
    TooManyFiles,
    /// Operation would block (EAGAIN)
    WouldBlock,
    /// Interrupted by a signal (EINTR)
    Interrupted,
    /// Timer cancelled by a wall-clock step (ECANCELED)
    Cancelled,
    /// Operation not supported (EOPNOTSUPP)
    NotSupported,
    /// Any other host errno
    Os(i32),
}

impl SyscallError {
    /// Convert to the errno value reported to C callers
    pub fn to_errno(&self) -> i32 {
        match self {
            SyscallError::InvalidArgument => libc::EINVAL,
            SyscallError::BadDescriptor => libc::EBADF,
            SyscallError::BadAddress => libc::EFAULT,
            SyscallError::AlreadyExists => libc::EEXIST,
            SyscallError::NotFound => libc::ENOENT,
            SyscallError::PermissionDenied => libc::EPERM,
            SyscallError::OutOfMemory => libc::ENOMEM,
            SyscallError::TooManyFiles => libc::EMFILE,
            SyscallError::WouldBlock => libc::EAGAIN,
            SyscallError::Interrupted => libc::EINTR,
            SyscallError::Cancelled => libc::ECANCELED,
            SyscallError::NotSupported => libc::EOPNOTSUPP,
            SyscallError::Os(errno) => *errno,
        }
    }

    /// Classify a raw errno value
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EINVAL => SyscallError::InvalidArgument,
            libc::EBADF => SyscallError::BadDescriptor,
            libc::EFAULT => SyscallError::BadAddress,
            libc::EEXIST => SyscallError::AlreadyExists,
            libc::ENOENT => SyscallError::NotFound,
            libc::EPERM => SyscallError::PermissionDenied,
            libc::ENOMEM => SyscallError::OutOfMemory,
            libc::EMFILE => SyscallError::TooManyFiles,
            libc::EAGAIN => SyscallError::WouldBlock,
            libc::EINTR => SyscallError::Interrupted,
            libc::ECANCELED => SyscallError::Cancelled,
            libc::EOPNOTSUPP => SyscallError::NotSupported,
            other => SyscallError::Os(other),
        }
    }

    /// Short description of the error class
    pub fn as_str(&self) -> &'static str {
        match self {
            SyscallError::InvalidArgument => "invalid argument",
            SyscallError::BadDescriptor => "bad file descriptor",
            SyscallError::BadAddress => "bad address",
            SyscallError::AlreadyExists => "already registered",
            SyscallError::NotFound => "not registered",
            SyscallError::PermissionDenied => "operation not permitted",
            SyscallError::OutOfMemory => "out of memory",
            SyscallError::TooManyFiles => "too many open files",
            SyscallError::WouldBlock => "operation would block",
            SyscallError::Interrupted => "interrupted",
            SyscallError::Cancelled => "timer cancelled",
            SyscallError::NotSupported => "operation not supported",
            SyscallError::Os(_) => "host error",
        }
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyscallError::Os(errno) => write!(f, "host error (errno {})", errno),
            other => f.write_str(other.as_str()),
        }
    }
}

impl std::error::Error for SyscallError {}

impl From<io::Error> for SyscallError {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => SyscallError::from_errno(errno),
            None => match err.kind() {
                io::ErrorKind::WouldBlock => SyscallError::WouldBlock,
                io::ErrorKind::Interrupted => SyscallError::Interrupted,
                io::ErrorKind::InvalidInput => SyscallError::InvalidArgument,
                io::ErrorKind::OutOfMemory => SyscallError::OutOfMemory,
                _ => SyscallError::Os(libc::EIO),
            },
        }
    }
}

impl From<SyscallError> for io::Error {
    fn from(err: SyscallError) -> Self {
        io::Error::from_raw_os_error(err.to_errno())
    }
}

/// Result type for shim operations
pub type Result<T> = core::result::Result<T, SyscallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping_is_stable() {
        assert_eq!(SyscallError::InvalidArgument.to_errno(), libc::EINVAL);
        assert_eq!(SyscallError::AlreadyExists.to_errno(), libc::EEXIST);
        assert_eq!(SyscallError::NotFound.to_errno(), libc::ENOENT);
        assert_eq!(SyscallError::Cancelled.to_errno(), libc::ECANCELED);
        assert_eq!(SyscallError::Os(libc::EPIPE).to_errno(), libc::EPIPE);
    }

    #[test]
    fn test_from_errno_classifies_known_values() {
        for err in [
            SyscallError::InvalidArgument,
            SyscallError::BadDescriptor,
            SyscallError::WouldBlock,
            SyscallError::Interrupted,
            SyscallError::PermissionDenied,
        ] {
            assert_eq!(SyscallError::from_errno(err.to_errno()), err);
        }
        assert_eq!(SyscallError::from_errno(libc::EPIPE), SyscallError::Os(libc::EPIPE));
    }

    #[test]
    fn test_io_error_conversion() {
        let err: SyscallError = io::Error::from_raw_os_error(libc::EBADF).into();
        assert_eq!(err, SyscallError::BadDescriptor);

        let err: SyscallError = io::Error::new(io::ErrorKind::Interrupted, "signal").into();
        assert_eq!(err, SyscallError::Interrupted);

        let back: io::Error = SyscallError::NotFound.into();
        assert_eq!(back.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn test_display() {
        assert_eq!(SyscallError::WouldBlock.to_string(), "operation would block");
        assert_eq!(SyscallError::Os(5).to_string(), "host error (errno 5)");
    }
}
