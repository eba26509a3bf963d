//! Native USB error codes

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// USB error types
///
/// Mirrors the libusb error space one-to-one. The discriminants are the native
/// codes, so [`UsbError::code`] is what a C caller would have received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[repr(i32)]
pub enum UsbError {
    /// Input/output error
    #[error("Input/Output Error")]
    Io = -1,
    /// Invalid parameter, including a handle of the wrong role or owner
    #[error("Invalid parameter")]
    InvalidParam = -2,
    /// Access denied (insufficient permissions)
    #[error("Access denied (insufficient permissions)")]
    Access = -3,
    /// No such device (it may have been disconnected)
    #[error("No such device (it may have been disconnected)")]
    NoDevice = -4,
    /// Entity not found
    #[error("Entity not found")]
    NotFound = -5,
    /// Resource busy
    #[error("Resource busy")]
    Busy = -6,
    /// Operation timed out
    #[error("Operation timed out")]
    Timeout = -7,
    /// Overflow
    #[error("Overflow")]
    Overflow = -8,
    /// Pipe error (endpoint stalled)
    #[error("Pipe error")]
    Pipe = -9,
    /// System call interrupted
    #[error("System call interrupted (perhaps due to signal)")]
    Interrupted = -10,
    /// Insufficient memory
    #[error("Insufficient memory")]
    NoMem = -11,
    /// Operation not supported or unimplemented on this platform
    #[error("Operation not supported or unimplemented on this platform")]
    NotSupported = -12,
    /// Other error
    #[error("Other error")]
    Other = -99,
}

impl UsbError {
    /// Native (negative) error code
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map a native error code back to an error
    ///
    /// Unknown negative codes become [`UsbError::Other`]. Returns `None` for
    /// zero and positive values, which are not errors.
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            code if code >= 0 => return None,
            -1 => Self::Io,
            -2 => Self::InvalidParam,
            -3 => Self::Access,
            -4 => Self::NoDevice,
            -5 => Self::NotFound,
            -6 => Self::Busy,
            -7 => Self::Timeout,
            -8 => Self::Overflow,
            -9 => Self::Pipe,
            -10 => Self::Interrupted,
            -11 => Self::NoMem,
            -12 => Self::NotSupported,
            _ => Self::Other,
        };
        Some(err)
    }
}

/// Type alias for results of USB entry points
pub type Result<T> = std::result::Result<T, UsbError>;

/// Render a result in the 0-or-negative convention
pub fn result_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        let all = [
            UsbError::Io,
            UsbError::InvalidParam,
            UsbError::Access,
            UsbError::NoDevice,
            UsbError::NotFound,
            UsbError::Busy,
            UsbError::Timeout,
            UsbError::Overflow,
            UsbError::Pipe,
            UsbError::Interrupted,
            UsbError::NoMem,
            UsbError::NotSupported,
            UsbError::Other,
        ];
        for err in all {
            assert_eq!(UsbError::from_code(err.code()), Some(err));
        }
    }

    #[test]
    fn test_unknown_negative_code_is_other() {
        assert_eq!(UsbError::from_code(-42), Some(UsbError::Other));
        assert_eq!(UsbError::from_code(0), None);
        assert_eq!(UsbError::from_code(7), None);
    }

    #[test]
    fn test_error_display() {
        let msg = format!("{}", UsbError::Pipe);
        assert!(msg.contains("Pipe"));
    }
}
