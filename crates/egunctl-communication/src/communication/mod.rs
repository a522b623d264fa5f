//! Byte-stream transports and receive-side framing
//!
//! The device link treats its transport as two primitives: a blocking
//! single-byte read and a write of a complete command. Everything else
//! (buffering, resynchronisation, message classification) happens above
//! this layer.

pub mod frame_decoder;
pub mod ring_buffer;
pub mod serial;
pub mod simulated;

use egunctl_core::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result of a single transport read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One byte was received
    Byte(u8),
    /// The read timed out without data; the caller should re-check its
    /// stop condition and read again
    Idle,
    /// The transport has been closed or failed. Terminal: the reader loop
    /// ends quietly.
    Closed,
}

/// Byte-stream connection to the controller
pub trait Transport: Send + Sync {
    /// Read one byte, blocking up to the transport's read timeout
    fn read_byte(&self) -> ReadOutcome;

    /// Write a complete command
    fn write_all(&self, data: &[u8]) -> Result<()>;

    /// Release the underlying handle. Later reads report `Closed` and
    /// later writes fail.
    fn close(&self);

    /// Human readable transport name (port path)
    fn name(&self) -> String;
}

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Line parameters for opening a serial transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Port path (e.g. "/dev/ttyU0")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5-8)
    pub data_bits: u8,
    /// Stop bits (1-2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Hardware flow control
    pub flow_control: bool,
    /// Read timeout of a single byte read. Bounds how long closing the
    /// connection waits for the reader thread.
    pub read_timeout: Duration,
}

impl ConnectionParams {
    /// Default line parameters of the controller on the given port
    pub fn serial(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    /// Override the baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            port: "/dev/ttyU0".to_string(),
            baud_rate: 19200,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: false,
            read_timeout: Duration::from_millis(250),
        }
    }
}
