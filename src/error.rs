use std::io;
use thiserror::Error;

/// Status kinds reported across the driver boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HsaStatus {
    InvalidArgument,
    NotFound,
    DeviceBusy,
    PermissionDenied,
    OutOfMemory,
    AlreadyOpen,
    NotOpen,
    NotInitialized,
    DriverUnsupported,
    InternalError,
}

impl HsaStatus {
    /// Numeric code in the `hsa_status_t` value space.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::InternalError => 0x1000,
            Self::InvalidArgument => 0x1001,
            Self::OutOfMemory => 0x1008,
            Self::NotInitialized => 0x100B,
            Self::NotFound => 0x2000,
            Self::DeviceBusy => 0x2001,
            Self::PermissionDenied => 0x2002,
            Self::AlreadyOpen => 0x2003,
            Self::NotOpen => 0x2004,
            Self::DriverUnsupported => 0x2005,
        }
    }
}

#[derive(Error, Debug)]
pub enum HsaError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid node ID: {0}")]
    InvalidNodeId(u32),

    #[error("Device node not found: {0}")]
    NotFound(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Out of device memory")]
    OutOfMemory,

    #[error("Driver already open: {0}")]
    AlreadyOpen(String),

    #[error("Driver is not open")]
    NotOpen,

    #[error("Driver is not initialized")]
    NotInitialized,

    #[error("Not supported by the kernel driver: {0}")]
    DriverUnsupported(String),

    #[error("Internal driver error: {0}")]
    Internal(String),
}

impl HsaError {
    #[must_use]
    pub const fn status(&self) -> HsaStatus {
        match self {
            Self::InvalidArgument(_) | Self::InvalidNodeId(_) => HsaStatus::InvalidArgument,
            Self::NotFound(_) => HsaStatus::NotFound,
            Self::DeviceBusy(_) => HsaStatus::DeviceBusy,
            Self::PermissionDenied(_) => HsaStatus::PermissionDenied,
            Self::OutOfMemory => HsaStatus::OutOfMemory,
            Self::AlreadyOpen(_) => HsaStatus::AlreadyOpen,
            Self::NotOpen => HsaStatus::NotOpen,
            Self::NotInitialized => HsaStatus::NotInitialized,
            Self::DriverUnsupported(_) => HsaStatus::DriverUnsupported,
            Self::Internal(_) => HsaStatus::InternalError,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Translates an OS error into a driver status, keeping `context` as the message.
    pub fn from_os(err: &io::Error, context: impl AsRef<str>) -> Self {
        let msg = format!("{}: {err}", context.as_ref());
        match err.raw_os_error() {
            Some(libc::ENOENT | libc::ENODEV | libc::ENXIO) => Self::NotFound(msg),
            Some(libc::EBUSY) => Self::DeviceBusy(msg),
            Some(libc::EACCES | libc::EPERM) => Self::PermissionDenied(msg),
            Some(libc::ENOMEM | libc::ENOSPC) => Self::OutOfMemory,
            Some(libc::EINVAL | libc::EBADF | libc::EFAULT) => Self::InvalidArgument(msg),
            Some(libc::ENOTTY | libc::EOPNOTSUPP | libc::ENOSYS) => Self::DriverUnsupported(msg),
            Some(_) => Self::Internal(msg),
            None => match err.kind() {
                io::ErrorKind::NotFound => Self::NotFound(msg),
                io::ErrorKind::PermissionDenied => Self::PermissionDenied(msg),
                io::ErrorKind::OutOfMemory => Self::OutOfMemory,
                io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
                    Self::InvalidArgument(msg)
                }
                io::ErrorKind::Unsupported => Self::DriverUnsupported(msg),
                _ => Self::Internal(msg),
            },
        }
    }
}

impl From<io::Error> for HsaError {
    fn from(err: io::Error) -> Self {
        Self::from_os(&err, "ioctl")
    }
}

// A convenient alias
pub type HsaResult<T> = Result<T, HsaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_maps_to_status() {
        let cases = [
            (libc::ENOENT, HsaStatus::NotFound),
            (libc::ENODEV, HsaStatus::NotFound),
            (libc::EBUSY, HsaStatus::DeviceBusy),
            (libc::EACCES, HsaStatus::PermissionDenied),
            (libc::EPERM, HsaStatus::PermissionDenied),
            (libc::ENOMEM, HsaStatus::OutOfMemory),
            (libc::EINVAL, HsaStatus::InvalidArgument),
            (libc::ENOTTY, HsaStatus::DriverUnsupported),
            (libc::EIO, HsaStatus::InternalError),
        ];
        for (errno, status) in cases {
            let err = HsaError::from_os(&io::Error::from_raw_os_error(errno), "test");
            assert_eq!(err.status(), status, "errno {errno}");
        }
    }

    #[test]
    fn os_message_keeps_context_not_errno() {
        let err = HsaError::from_os(&io::Error::from_raw_os_error(libc::ENOENT), "/dev/accel/x");
        let HsaError::NotFound(msg) = err else {
            panic!("expected NotFound");
        };
        assert!(msg.starts_with("/dev/accel/x"));
    }

    #[test]
    fn invalid_node_is_invalid_argument() {
        assert_eq!(HsaError::InvalidNodeId(7).status(), HsaStatus::InvalidArgument);
        assert_eq!(HsaStatus::InvalidArgument.code(), 0x1001);
    }
}
