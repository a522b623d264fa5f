//! Bridge configuration
//!
//! Provides loading and validation of the MQTT bridge configuration.
//! Supports JSON (the default) and TOML documents.
//!
//! The configuration is organized into two sections:
//! - `egun`: the serial link to the electron source controller
//! - `mqtt`: the broker connection and the base topic
//!
//! Documents are first deserialized into an all-optional raw form and then
//! validated, so that a missing key is reported by its dotted name instead
//! of a generic deserializer message.

use crate::error::{ConfigError, ConfigResult, SettingsError, SettingsResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default serial baud rate of the controller
pub const DEFAULT_BAUDRATE: u32 = 19200;

/// Default MQTT keepalive interval in seconds
pub const DEFAULT_KEEPALIVE_SECS: u64 = 30;

/// Client id used when the configuration does not name one
pub const DEFAULT_CLIENT_ID: &str = "egun-mqtt-bridge";

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Serial port path, e.g. `/dev/ttyU0`
    pub port: String,
    /// Serial baud rate
    pub baudrate: u32,
    /// Retransmissions of an unanswered command
    pub retries: u32,
    /// Settle time after set commands, in seconds
    pub stabilization_delay_secs: u64,
    /// Power the device off when the bridge terminates
    pub shutdown_on_terminate: bool,
}

impl DeviceSettings {
    /// Settings for `port` with every other value at its default
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baudrate: DEFAULT_BAUDRATE,
            retries: 3,
            stabilization_delay_secs: 5,
            shutdown_on_terminate: true,
        }
    }
}

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Topic prefix, always ending in `/`
    pub basetopic: String,
    pub client_id: Option<String>,
    pub keepalive_secs: u64,
}

impl MqttSettings {
    /// Client id to present to the broker
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or(DEFAULT_CLIENT_ID)
    }

    /// Prefix `suffix` with the base topic
    pub fn topic(&self, suffix: &str) -> String {
        format!("{}{}", self.basetopic, suffix)
    }
}

/// Complete bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub egun: DeviceSettings,
    pub mqtt: MqttSettings,
}

impl BridgeConfig {
    /// Load config from file. `.toml` files are read as TOML, everything
    /// else as JSON.
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::LoadError(format!("{}: {}", path.display(), e)))?;

        if path.extension().is_some_and(|ext| ext == "toml") {
            Self::from_toml_str(&content)
        } else {
            Self::from_json_str(&content)
        }
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(content: &str) -> SettingsResult<Self> {
        let raw: RawDocument = serde_json::from_str(content)?;
        Ok(raw.validate()?)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> SettingsResult<Self> {
        let raw: RawDocument = toml::from_str(content)?;
        Ok(raw.validate()?)
    }
}

/// Where the bridge reads its configuration from
///
/// Called once at startup and again on every reload request.
pub trait ConfigSource: Send + Sync {
    /// Load and validate the current configuration
    fn load(&self) -> SettingsResult<BridgeConfig>;

    /// Human readable origin, used in log messages
    fn describe(&self) -> String;
}

/// Configuration file on disk
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> SettingsResult<BridgeConfig> {
        BridgeConfig::load_from_file(&self.path)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Port given either as a number or as a numeric string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(i64),
    Text(String),
}

#[derive(Debug, Default, Deserialize)]
struct RawDocument {
    egun: Option<RawDevice>,
    mqtt: Option<RawMqtt>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDevice {
    port: Option<String>,
    baudrate: Option<u32>,
    retries: Option<u32>,
    stabilization_delay_secs: Option<u64>,
    shutdown_on_terminate: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMqtt {
    broker: Option<String>,
    port: Option<PortValue>,
    user: Option<String>,
    password: Option<String>,
    basetopic: Option<String>,
    client_id: Option<String>,
    keepalive_secs: Option<u64>,
}

fn required<T>(value: Option<T>, key: &str) -> ConfigResult<T> {
    value.ok_or_else(|| ConfigError::MissingKey(key.to_string()))
}

fn non_empty(value: String, key: &str) -> ConfigResult<String> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    Ok(value)
}

fn broker_port(value: PortValue) -> ConfigResult<u16> {
    let (number, text) = match value {
        PortValue::Number(n) => (Some(n), n.to_string()),
        PortValue::Text(s) => (s.trim().parse::<i64>().ok(), s),
    };
    match number {
        Some(n) if (1..=65535).contains(&n) => Ok(n as u16),
        _ => Err(ConfigError::ValueOutOfRange {
            key: "mqtt.port".to_string(),
            value: text,
        }),
    }
}

fn normalize_basetopic(topic: String) -> String {
    if topic.ends_with('/') {
        topic
    } else {
        tracing::warn!("Base topic not ending in trailing slash /. Appending");
        format!("{}/", topic)
    }
}

impl RawDocument {
    fn validate(self) -> ConfigResult<BridgeConfig> {
        let egun = required(self.egun, "egun")?;
        let port = non_empty(required(egun.port, "egun.port")?, "egun.port")?;

        let mut device = DeviceSettings::new(port);
        if let Some(baudrate) = egun.baudrate {
            if baudrate == 0 {
                return Err(ConfigError::ValueOutOfRange {
                    key: "egun.baudrate".to_string(),
                    value: baudrate.to_string(),
                });
            }
            device.baudrate = baudrate;
        }
        if let Some(retries) = egun.retries {
            device.retries = retries;
        }
        if let Some(delay) = egun.stabilization_delay_secs {
            device.stabilization_delay_secs = delay;
        }
        if let Some(shutdown) = egun.shutdown_on_terminate {
            device.shutdown_on_terminate = shutdown;
        }

        let mqtt = required(self.mqtt, "mqtt")?;
        let broker = non_empty(required(mqtt.broker, "mqtt.broker")?, "mqtt.broker")?;
        let port = broker_port(required(mqtt.port, "mqtt.port")?)?;
        let user = required(mqtt.user, "mqtt.user")?;
        let password = required(mqtt.password, "mqtt.password")?;
        let basetopic = required(mqtt.basetopic, "mqtt.basetopic")?;
        if basetopic.is_empty() {
            return Err(ConfigError::Invalid {
                key: "mqtt.basetopic".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        let keepalive_secs = mqtt.keepalive_secs.unwrap_or(DEFAULT_KEEPALIVE_SECS);
        if keepalive_secs == 0 {
            return Err(ConfigError::ValueOutOfRange {
                key: "mqtt.keepalive_secs".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(BridgeConfig {
            egun: device,
            mqtt: MqttSettings {
                broker,
                port,
                user,
                password,
                basetopic: normalize_basetopic(basetopic),
                client_id: mqtt.client_id.filter(|id| !id.is_empty()),
                keepalive_secs,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "egun": { "port": "/dev/ttyU0" },
        "mqtt": {
            "broker": "10.0.0.5",
            "port": 1883,
            "user": "egun",
            "password": "secret",
            "basetopic": "lab/egun/"
        }
    }"#;

    #[test]
    fn test_minimal_json_uses_defaults() {
        let config = BridgeConfig::from_json_str(MINIMAL).unwrap();
        assert_eq!(config.egun, DeviceSettings::new("/dev/ttyU0"));
        assert_eq!(config.egun.baudrate, 19200);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.keepalive_secs, DEFAULT_KEEPALIVE_SECS);
        assert_eq!(config.mqtt.client_id(), DEFAULT_CLIENT_ID);
        assert_eq!(config.mqtt.topic("egun/voltage"), "lab/egun/egun/voltage");
    }

    #[test]
    fn test_port_as_string() {
        let doc = MINIMAL.replace("1883", "\"8883\"");
        let config = BridgeConfig::from_json_str(&doc).unwrap();
        assert_eq!(config.mqtt.port, 8883);
    }

    #[test]
    fn test_port_out_of_range() {
        for bad in ["0", "65536", "\"abc\"", "-1"] {
            let doc = MINIMAL.replace("1883", bad);
            let err = BridgeConfig::from_json_str(&doc).unwrap_err();
            assert!(
                matches!(
                    err,
                    SettingsError::Config(ConfigError::ValueOutOfRange { ref key, .. }) if key == "mqtt.port"
                ),
                "{bad}: {err}"
            );
        }
    }

    #[test]
    fn test_basetopic_gets_trailing_slash() {
        let doc = MINIMAL.replace("lab/egun/", "lab/egun");
        let config = BridgeConfig::from_json_str(&doc).unwrap();
        assert_eq!(config.mqtt.basetopic, "lab/egun/");
    }

    #[test]
    fn test_empty_basetopic_rejected() {
        let doc = MINIMAL.replace("lab/egun/", "");
        let err = BridgeConfig::from_json_str(&doc).unwrap_err();
        assert!(matches!(err, SettingsError::Config(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_missing_keys_are_named() {
        let cases = [
            (r#"{"mqtt": {}}"#, "egun"),
            (r#"{"egun": {}}"#, "egun.port"),
            (r#"{"egun": {"port": "/dev/ttyU0"}}"#, "mqtt"),
            (r#"{"egun": {"port": "/dev/ttyU0"}, "mqtt": {"broker": "b", "port": 1}}"#, "mqtt.user"),
        ];
        for (doc, key) in cases {
            match BridgeConfig::from_json_str(doc) {
                Err(SettingsError::Config(ConfigError::MissingKey(k))) => assert_eq!(k, key),
                other => panic!("expected missing {key}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_toml_document() {
        let doc = r#"
            [egun]
            port = "/dev/ttyUSB1"
            baudrate = 9600
            shutdown_on_terminate = false

            [mqtt]
            broker = "localhost"
            port = "1883"
            user = "u"
            password = "p"
            basetopic = "egun"
            client_id = "lab-bridge"
        "#;
        let config = BridgeConfig::from_toml_str(doc).unwrap();
        assert_eq!(config.egun.baudrate, 9600);
        assert!(!config.egun.shutdown_on_terminate);
        assert_eq!(config.mqtt.basetopic, "egun/");
        assert_eq!(config.mqtt.client_id(), "lab-bridge");
    }

    #[test]
    fn test_malformed_json() {
        let err = BridgeConfig::from_json_str("{ egun").unwrap_err();
        assert!(matches!(err, SettingsError::JsonError(_)));
    }
}
