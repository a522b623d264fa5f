//! Error handling for the electron source controller
//!
//! Provides error types for the layers of the device link:
//! - Device errors (command validation, missing connection, unanswered requests)
//! - Connection errors (transport open/read/write failures)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Device error type
///
/// Represents errors raised by the command layer before or after talking
/// to the electron source controller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// No transport is open
    #[error("Electron gun currently not connected")]
    NotConnected,

    /// A command argument is out of range or malformed. Raised before
    /// anything is written to the wire.
    #[error("Invalid parameter '{param}': {reason}")]
    InvalidParameter {
        /// The offending parameter name.
        param: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The device never produced the awaited reply.
    ///
    /// Ordinary synchronous calls report this as a no-response sentinel;
    /// this error is reserved for operations that cannot complete without
    /// an answer (e.g. waiting for a voltage to converge).
    #[error("Timeout waiting for {filter}")]
    CommunicationTimeout {
        /// The filter key that was being waited for.
        filter: String,
    },

    /// Receive buffer refused a push
    #[error("Buffer overflow: {requested} bytes requested, {available} available")]
    BufferOverflow {
        /// Bytes the caller tried to store.
        requested: usize,
        /// Free slots at the time of the push.
        available: usize,
    },

    /// Generic device error
    #[error("Device error: {message}")]
    Other {
        /// The error message.
        message: String,
    },
}

impl DeviceError {
    /// Shorthand for [`DeviceError::InvalidParameter`]
    pub fn invalid(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            param: param.into(),
            reason: reason.into(),
        }
    }
}

/// Connection error type
///
/// Represents failures of the byte-stream transport. Any of these ends the
/// reader loop and degrades the connection to "not connected".
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// Connection lost
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// Serial port error
    #[error("Serial port error: {reason}")]
    SerialError {
        /// The reason for the serial port error.
        reason: String,
    },

    /// Invalid connection parameters
    #[error("Invalid connection parameters: {reason}")]
    InvalidParameters {
        /// The reason the parameters are invalid.
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {reason}")]
    IoError {
        /// The reason for the I/O error.
        reason: String,
    },
}

/// Main error type
///
/// A unified error type that can represent any error from the device link.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Device error
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if the operation failed because no transport was open
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Error::Device(DeviceError::NotConnected))
    }

    /// Check if this is a transport failure (TransportFault family)
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Io(_))
    }

    /// Check if the link to the device is unusable, either because it was
    /// never open or because the transport failed
    pub fn is_link_down(&self) -> bool {
        self.is_not_connected() || self.is_transport_fault()
    }

    /// Check if a parameter was rejected
    pub fn is_invalid_parameter(&self) -> bool {
        matches!(self, Error::Device(DeviceError::InvalidParameter { .. }))
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Device(DeviceError::CommunicationTimeout { .. }))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeviceError::invalid("voltage", "has to be in range from 0 to 3250V");
        assert_eq!(
            err.to_string(),
            "Invalid parameter 'voltage': has to be in range from 0 to 3250V"
        );

        let err = ConnectionError::FailedToOpen {
            port: "/dev/ttyU0".to_string(),
            reason: "no such file".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to open port /dev/ttyU0: no such file");
    }

    #[test]
    fn test_classification() {
        let err: Error = DeviceError::NotConnected.into();
        assert!(err.is_not_connected());
        assert!(err.is_link_down());
        assert!(!err.is_transport_fault());

        let err: Error = ConnectionError::ConnectionLost {
            reason: "eof".to_string(),
        }
        .into();
        assert!(err.is_transport_fault());
        assert!(err.is_link_down());

        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert!(err.is_transport_fault());

        let err: Error = DeviceError::invalid("channel", "out of range").into();
        assert!(err.is_invalid_parameter());
        assert!(!err.is_link_down());
    }
}
