//! egunctl Settings Crate
//!
//! Loads and validates the configuration of the MQTT bridge.

pub mod config;
pub mod error;

pub use config::{
    BridgeConfig, ConfigSource, DeviceSettings, FileConfigSource, MqttSettings, DEFAULT_BAUDRATE,
    DEFAULT_CLIENT_ID, DEFAULT_KEEPALIVE_SECS,
};
pub use error::{ConfigError, ConfigResult, SettingsError, SettingsResult};
