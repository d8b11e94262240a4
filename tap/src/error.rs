// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Errors returned by the tap subsystem.

use filter::ProgramError;
use std::io;
use thiserror::Error;

/// Failures reported by an interface driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("Operation not supported by the driver")]
    Unsupported,
    #[error("Interface is down")]
    Down,
    #[error("Driver failure: {0}")]
    Failed(String),
}

/// Errors returned by tap operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TapError {
    #[error("Device busy")]
    Busy,
    #[error("No such tap device")]
    NotFound,
    #[error("Not attached to an interface, or the interface went away")]
    NoSuchDevice,
    #[error("Interface is down")]
    NetworkDown,
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Invalid filter program: {0}")]
    InvalidProgram(#[from] ProgramError),
    #[error("Message of {len} bytes exceeds the maximum of {max}")]
    MessageTooLong { len: usize, max: usize },
    #[error("Out of memory")]
    NoMemory,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("Interrupted")]
    Interrupted,
    #[error("Operation would block")]
    WouldBlock,
    #[error("Operation not supported")]
    NotSupported,
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl TapError {
    /// Tell if the operation may succeed if retried unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, TapError::Interrupted | TapError::WouldBlock)
    }

    /// The errno value a device file would report for this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            TapError::Busy => 16,        // EBUSY
            TapError::NotFound => 2,     // ENOENT
            TapError::NoSuchDevice => 6, // ENXIO
            TapError::NetworkDown | TapError::Driver(DriverError::Down) => 50, // ENETDOWN
            TapError::InvalidArgument(_) | TapError::InvalidProgram(_) => 22, // EINVAL
            TapError::MessageTooLong { .. } => 40, // EMSGSIZE
            TapError::NoMemory => 12,              // ENOMEM
            TapError::PermissionDenied => 1,       // EPERM
            TapError::Interrupted => 4,            // EINTR
            TapError::WouldBlock => 35,            // EWOULDBLOCK
            TapError::NotSupported | TapError::Driver(DriverError::Unsupported) => 45, // EOPNOTSUPP
            TapError::Driver(DriverError::Failed(_)) => 5, // EIO
        }
    }
}

impl From<TapError> for io::Error {
    fn from(err: TapError) -> Self {
        let kind = match &err {
            TapError::Busy => io::ErrorKind::ResourceBusy,
            TapError::NotFound | TapError::NoSuchDevice => io::ErrorKind::NotFound,
            TapError::NetworkDown | TapError::Driver(DriverError::Down) => {
                io::ErrorKind::NetworkDown
            }
            TapError::InvalidArgument(_) | TapError::InvalidProgram(_) => {
                io::ErrorKind::InvalidInput
            }
            TapError::MessageTooLong { .. } => io::ErrorKind::FileTooLarge,
            TapError::NoMemory => io::ErrorKind::OutOfMemory,
            TapError::PermissionDenied => io::ErrorKind::PermissionDenied,
            TapError::Interrupted => io::ErrorKind::Interrupted,
            TapError::WouldBlock => io::ErrorKind::WouldBlock,
            TapError::NotSupported | TapError::Driver(DriverError::Unsupported) => {
                io::ErrorKind::Unsupported
            }
            TapError::Driver(DriverError::Failed(_)) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod test {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(TapError::Interrupted.is_retryable());
        assert!(TapError::WouldBlock.is_retryable());
        assert!(!TapError::NoSuchDevice.is_retryable());
        assert!(!TapError::Driver(DriverError::Down).is_retryable());
    }

    #[test]
    fn io_error_kinds() {
        let err: io::Error = TapError::WouldBlock.into();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        let err: io::Error = TapError::InvalidArgument("bad").into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(TapError::Busy.errno(), 16);
    }
}
