//! Driver error types
//!
//! [`DriverError`] is what every session- and hotplug-facing operation
//! returns. [`TransferError`] is the transport's own status, passed through
//! untouched so callers can tell a timeout from a pulled cable.

use common::BusLocation;
use thiserror::Error;

/// errno values surfaced by the character-stream interface
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const EBUSY: i32 = 16;
    pub const ENODEV: i32 = 19;
    pub const EPIPE: i32 = 32;
    pub const EPROTO: i32 = 71;
    pub const EOVERFLOW: i32 = 75;
    pub const ECONNRESET: i32 = 104;
    pub const ESHUTDOWN: i32 = 108;
    pub const ETIMEDOUT: i32 = 110;
}

/// Failure reported by the transport for a single transfer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("transfer timed out")]
    Timeout,

    #[error("endpoint stalled")]
    Stall,

    #[error("device is gone")]
    NoDevice,

    #[error("request canceled")]
    Canceled,

    #[error("connection reset")]
    Reset,

    #[error("device shut down")]
    Shutdown,

    #[error("device sent more data than requested")]
    Overflow,

    #[error("protocol error")]
    Protocol,

    #[error("I/O error")]
    Io,

    #[error("transport error: {0}")]
    Other(String),
}

impl TransferError {
    /// errno equivalent of this status
    pub fn errno(&self) -> i32 {
        match self {
            Self::Timeout => errno::ETIMEDOUT,
            Self::Stall => errno::EPIPE,
            Self::NoDevice => errno::ENODEV,
            Self::Canceled => errno::ENOENT,
            Self::Reset => errno::ECONNRESET,
            Self::Shutdown => errno::ESHUTDOWN,
            Self::Overflow => errno::EOVERFLOW,
            Self::Protocol => errno::EPROTO,
            Self::Io | Self::Other(_) => errno::EIO,
        }
    }

    /// Statuses a write completion sees when a request is torn down on purpose
    ///
    /// These are the only non-success statuses that are not worth a warning.
    pub fn is_expected_shutdown(&self) -> bool {
        matches!(self, Self::Canceled | Self::Reset | Self::Shutdown)
    }
}

/// Errors returned by driver operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// No device is published under the requested minor
    #[error("no device registered for minor {0}")]
    NoSuchDevice(u32),

    /// The session no longer refers to a usable device
    #[error("no device bound to session")]
    NoDevice,

    /// Attach found no bulk-in or no bulk-out endpoint
    #[error("could not find both bulk-in and bulk-out endpoints")]
    EndpointNotFound,

    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    /// Copying to or from caller memory failed
    #[error("bad address in caller buffer")]
    Fault,

    /// A device is already published at this bus location
    #[error("a device is already attached at {0}")]
    AlreadyAttached(BusLocation),

    /// Every minor number in the configured range is taken
    #[error("no free minor number (range {base}..{end})")]
    MinorsExhausted { base: u32, end: u32 },

    #[error(transparent)]
    Transport(#[from] TransferError),
}

impl DriverError {
    /// errno equivalent, positive (callers negate it for the C-style surface)
    pub fn errno(&self) -> i32 {
        match self {
            Self::NoSuchDevice(_) | Self::NoDevice | Self::EndpointNotFound => errno::ENODEV,
            Self::OutOfMemory(_) => errno::ENOMEM,
            Self::Fault => errno::EFAULT,
            Self::AlreadyAttached(_) | Self::MinorsExhausted { .. } => errno::EBUSY,
            Self::Transport(e) => e.errno(),
        }
    }
}

impl From<DriverError> for std::io::Error {
    fn from(err: DriverError) -> Self {
        let kind = match &err {
            DriverError::NoSuchDevice(_) | DriverError::NoDevice => std::io::ErrorKind::NotFound,
            DriverError::OutOfMemory(_) => std::io::ErrorKind::OutOfMemory,
            DriverError::Fault => std::io::ErrorKind::InvalidInput,
            DriverError::Transport(TransferError::Timeout) => std::io::ErrorKind::TimedOut,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// Type alias for driver results
pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_shutdown_statuses() {
        assert!(TransferError::Canceled.is_expected_shutdown());
        assert!(TransferError::Reset.is_expected_shutdown());
        assert!(TransferError::Shutdown.is_expected_shutdown());

        assert!(!TransferError::Timeout.is_expected_shutdown());
        assert!(!TransferError::Stall.is_expected_shutdown());
        assert!(!TransferError::NoDevice.is_expected_shutdown());
        assert!(!TransferError::Io.is_expected_shutdown());
    }

    #[test]
    fn test_transport_errno_passthrough() {
        let err = DriverError::from(TransferError::Timeout);
        assert_eq!(err.errno(), errno::ETIMEDOUT);

        let err = DriverError::from(TransferError::NoDevice);
        assert_eq!(err.errno(), errno::ENODEV);
    }

    #[test]
    fn test_taxonomy_errno() {
        assert_eq!(DriverError::NoSuchDevice(192).errno(), errno::ENODEV);
        assert_eq!(DriverError::EndpointNotFound.errno(), errno::ENODEV);
        assert_eq!(DriverError::OutOfMemory(64).errno(), errno::ENOMEM);
        assert_eq!(DriverError::Fault.errno(), errno::EFAULT);
        assert_eq!(
            DriverError::AlreadyAttached(BusLocation::new(1, 4)).errno(),
            errno::EBUSY
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io: std::io::Error = DriverError::Transport(TransferError::Timeout).into();
        assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);

        let io: std::io::Error = DriverError::NoSuchDevice(3).into();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
        assert!(io.to_string().contains("minor 3"));
    }
}
