//! Error types for the bridge crate.

use thiserror::Error;

/// Failures of the message bus client
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    /// The client could not be created or started
    #[error("Failed to connect to {broker}: {reason}")]
    Connect { broker: String, reason: String },

    /// A publish was refused by the client
    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    /// The client has been disconnected
    #[error("Bus client disconnected")]
    Disconnected,
}

/// A bus request that cannot be turned into a device command
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    /// Payload is not a JSON object with a `channel` field
    #[error("Received invalid request {topic}:{payload}")]
    Malformed { topic: String, payload: String },

    /// `channel` is outside 1..=4
    #[error("Received invalid request for channel {channel} on {topic}")]
    InvalidChannel { topic: String, channel: String },
}
