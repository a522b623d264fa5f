//! Topic names and payloads of the bridge
//!
//! Every topic is relative to the configured base topic. Payloads are JSON
//! objects; status topics without a body are published with an empty
//! payload.

use crate::bus::BusMessage;
use crate::error::RequestError;
use crate::queue::QueuedCommand;
use serde::{Deserialize, Serialize};

pub const CONNECTED: &str = "connected";
pub const KEEPALIVE: &str = "keepalive";
pub const ERROR: &str = "error";
pub const CONFIG_RELOAD: &str = "config/reload";
pub const CONFIG_RELOADED: &str = "config/reloaded";

pub const EGUN_ID: &str = "egun/id";
pub const EGUN_VOLTAGE: &str = "egun/voltage";
pub const EGUN_CURRENT: &str = "egun/current";
pub const EGUN_CONNECTED: &str = "egun/connected";
pub const EGUN_CONFAILED: &str = "egun/confailed";
pub const EGUN_RECONNECTING: &str = "egun/reconnecting";

pub const ID_REQUEST: &str = "egun/id/request";
pub const VOLTAGE_REQUEST: &str = "egun/voltage/request";
pub const CURRENT_REQUEST: &str = "egun/current/request";

/// Body of `egun/id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdPayload {
    pub version: String,
    pub revision: String,
}

/// Body of `egun/voltage`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoltagePayload {
    pub channel: u8,
    pub voltage: i64,
}

/// Body of `egun/current`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentPayload {
    pub channel: u8,
    pub current: f64,
}

/// Body of `egun/connected` and `egun/reconnecting`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortPayload {
    pub port: String,
}

/// Body of `egun/confailed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConFailedPayload {
    pub port: String,
    pub exception: String,
}

/// Body of `error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Turn an incoming bus message into a device command.
///
/// Returns `Ok(None)` for topics that are not requests, including the
/// bridge's own publishes that come back through the `#` subscription.
pub fn parse_request(
    basetopic: &str,
    msg: &BusMessage,
) -> Result<Option<QueuedCommand>, RequestError> {
    let Some(suffix) = msg.topic.strip_prefix(basetopic) else {
        return Ok(None);
    };

    match suffix {
        ID_REQUEST => Ok(Some(QueuedCommand::Identify)),
        VOLTAGE_REQUEST => channel_of(msg).map(|ch| Some(QueuedCommand::GetVoltage(ch))),
        CURRENT_REQUEST => channel_of(msg).map(|ch| Some(QueuedCommand::GetCurrent(ch))),
        _ => Ok(None),
    }
}

fn channel_of(msg: &BusMessage) -> Result<u8, RequestError> {
    let malformed = || RequestError::Malformed {
        topic: msg.topic.clone(),
        payload: String::from_utf8_lossy(&msg.payload).into_owned(),
    };

    let value: serde_json::Value = serde_json::from_slice(&msg.payload).map_err(|_| malformed())?;
    let channel = value.get("channel").ok_or_else(malformed)?;

    match channel.as_i64() {
        Some(ch @ 1..=4) => Ok(ch as u8),
        _ => Err(RequestError::InvalidChannel {
            topic: msg.topic.clone(),
            channel: channel.to_string(),
        }),
    }
}
