//! Loading bridge configuration from disk

use egunctl_settings::{BridgeConfig, ConfigSource, FileConfigSource, SettingsError};
use std::fs;
use tempfile::TempDir;

const JSON: &str = r#"{
    "egun": { "port": "/dev/ttyU0", "retries": 5 },
    "mqtt": {
        "broker": "broker.local",
        "port": "1883",
        "user": "egun",
        "password": "secret",
        "basetopic": "lab/egun"
    }
}"#;

#[test]
fn test_load_json_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("egunmqtt.conf");
    fs::write(&path, JSON).unwrap();

    let config = BridgeConfig::load_from_file(&path).unwrap();
    assert_eq!(config.egun.port, "/dev/ttyU0");
    assert_eq!(config.egun.retries, 5);
    assert_eq!(config.mqtt.port, 1883);
    assert_eq!(config.mqtt.basetopic, "lab/egun/");
}

#[test]
fn test_load_toml_by_extension() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bridge.toml");
    fs::write(
        &path,
        r#"
[egun]
port = "/dev/ttyU1"

[mqtt]
broker = "localhost"
port = 1884
user = "u"
password = "p"
basetopic = "egun/"
"#,
    )
    .unwrap();

    let config = BridgeConfig::load_from_file(&path).unwrap();
    assert_eq!(config.egun.port, "/dev/ttyU1");
    assert_eq!(config.mqtt.port, 1884);
}

#[test]
fn test_missing_file() {
    let dir = TempDir::new().unwrap();
    let source = FileConfigSource::new(dir.path().join("absent.conf"));

    assert!(matches!(source.load(), Err(SettingsError::LoadError(_))));
    assert!(source.describe().ends_with("absent.conf"));
}

#[test]
fn test_source_picks_up_changes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("egunmqtt.conf");
    fs::write(&path, JSON).unwrap();
    let source = FileConfigSource::new(&path);
    assert_eq!(source.load().unwrap().mqtt.broker, "broker.local");

    fs::write(&path, JSON.replace("broker.local", "broker2.local")).unwrap();
    assert_eq!(source.load().unwrap().mqtt.broker, "broker2.local");

    fs::write(&path, "{ not json").unwrap();
    assert!(matches!(source.load(), Err(SettingsError::JsonError(_))));
}
