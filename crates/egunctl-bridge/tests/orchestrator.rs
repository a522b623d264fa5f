//! Bridge behaviour against the in-memory bus and simulated devices

use egunctl_bridge::{
    BridgeState, BridgeTiming, DeviceConnector, MemoryBus, Orchestrator, QueuedCommand,
};
use egunctl_communication::{Connection, ConnectionConfig, SimulatedTransport, Transport};
use egunctl_core::{ConnectionError, Result};
use egunctl_settings::{DeviceSettings, FileConfigSource};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const BASE: &str = "lab/egun/";

fn config_json(basetopic: &str) -> String {
    format!(
        r#"{{
            "egun": {{ "port": "/dev/ttyU0" }},
            "mqtt": {{
                "broker": "localhost",
                "port": 1883,
                "user": "egun",
                "password": "secret",
                "basetopic": "{}"
            }}
        }}"#,
        basetopic
    )
}

/// Hands out prepared transports; `None` entries simulate a failing open
struct ScriptedDevices {
    transports: Mutex<VecDeque<Option<Arc<SimulatedTransport>>>>,
}

impl ScriptedDevices {
    fn new(transports: Vec<Option<Arc<SimulatedTransport>>>) -> Self {
        Self {
            transports: Mutex::new(transports.into()),
        }
    }
}

impl DeviceConnector for ScriptedDevices {
    fn open(&self, settings: &DeviceSettings) -> Result<Connection> {
        match self.transports.lock().pop_front().flatten() {
            Some(sim) => {
                let transport: Arc<dyn Transport> = sim;
                let config = ConnectionConfig {
                    reply_timeout: Duration::from_millis(200),
                    retries: 1,
                    ..ConnectionConfig::default()
                }
                .without_delays();
                Connection::with_transport(transport, config)
            }
            None => Err(ConnectionError::FailedToOpen {
                port: settings.port.clone(),
                reason: "No such file or directory".to_string(),
            }
            .into()),
        }
    }
}

fn device() -> Arc<SimulatedTransport> {
    Arc::new(SimulatedTransport::with_responder(|cmd| match cmd {
        "id" => vec!["electronctrl_20231112_3".to_string()],
        "psugetv1" => vec!["v1:2018".to_string()],
        "psugetv2" => vec!["v2:1800".to_string()],
        "psugeta3" => vec!["a3:0150".to_string()],
        _ => Vec::new(),
    }))
}

struct Harness {
    _dir: TempDir,
    path: PathBuf,
    bus: MemoryBus,
    bridge: Orchestrator,
}

fn harness(transports: Vec<Option<Arc<SimulatedTransport>>>) -> Harness {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("egunmqtt.conf");
    fs::write(&path, config_json(BASE)).unwrap();

    let bus = MemoryBus::new();
    let bridge = Orchestrator::new(
        Box::new(FileConfigSource::new(&path)),
        Arc::new(bus.clone()),
        Box::new(ScriptedDevices::new(transports)),
    )
    .with_timing(BridgeTiming {
        loop_wait: Duration::from_millis(10),
        reconnect_countdown: 2,
        command_throttle: Duration::ZERO,
        connect_settle: Duration::ZERO,
    });

    Harness {
        _dir: dir,
        path,
        bus,
        bridge,
    }
}

fn topic(suffix: &str) -> String {
    format!("{}{}", BASE, suffix)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_voltage_request_end_to_end() {
    let sim = device();
    let mut h = harness(vec![Some(sim.clone())]);
    assert_eq!(h.bridge.state(), BridgeState::NoConfig);

    assert!(h.bridge.tick());
    assert_eq!(h.bridge.state(), BridgeState::Connected);
    assert_eq!(h.bus.subscriptions(), vec![topic("#")]);
    assert_eq!(h.bus.published_on(&topic("connected")).len(), 1);
    assert_eq!(
        h.bus.published_on(&topic("egun/connected"))[0].payload_str(),
        r#"{"port":"/dev/ttyU0"}"#
    );

    let id = h.bus.published_on(&topic("egun/id"));
    assert_eq!(id.len(), 1);
    assert!(id[0].retain);
    assert_eq!(id[0].payload_str(), r#"{"version":"20231112","revision":"3"}"#);

    sim.clear_writes();
    h.bus.clear_published();
    assert!(h.bus.inject(&topic("egun/voltage/request"), br#"{"channel":2}"#));
    assert!(h.bridge.tick());

    assert!(wait_until(|| !h.bus.published_on(&topic("egun/voltage")).is_empty()));
    assert_eq!(sim.written_commands(), vec!["$$$psugetv2\n".to_string()]);

    let voltage = h.bus.published_on(&topic("egun/voltage"));
    assert_eq!(voltage.len(), 1);
    assert_eq!(voltage[0].payload_str(), r#"{"channel":2,"voltage":1800}"#);
    assert!(!voltage[0].retain);
}

#[test]
fn test_current_request_publishes_microamps() {
    let sim = device();
    let mut h = harness(vec![Some(sim)]);
    h.bridge.tick();

    h.bus.inject(&topic("egun/current/request"), br#"{"channel":3}"#);
    h.bridge.tick();

    assert!(wait_until(|| !h.bus.published_on(&topic("egun/current")).is_empty()));
    assert_eq!(
        h.bus.published_on(&topic("egun/current"))[0].payload_str(),
        r#"{"channel":3,"current":15.0}"#
    );
}

#[test]
fn test_queued_commands_survive_reconnect_in_order() {
    let first = device();
    let second = device();
    let mut h = harness(vec![Some(first.clone()), None, Some(second.clone())]);

    h.bridge.tick();
    assert_eq!(h.bridge.state(), BridgeState::Connected);

    first.disconnect();
    assert!(wait_until(|| h
        .bridge
        .connection()
        .is_some_and(|c| !c.is_open())));

    h.bus.inject(&topic("egun/voltage/request"), br#"{"channel":1}"#);
    h.bus.inject(&topic("egun/current/request"), br#"{"channel":3}"#);
    h.bus.inject(&topic("egun/voltage/request"), br#"{"channel":2}"#);

    h.bridge.tick();
    assert_eq!(h.bridge.state(), BridgeState::Reconnecting);
    assert!(!h.bus.published_on(&topic("egun/reconnecting")).is_empty());
    assert_eq!(
        h.bridge.queue().pending(),
        vec![
            QueuedCommand::GetVoltage(1),
            QueuedCommand::GetCurrent(3),
            QueuedCommand::GetVoltage(2),
        ]
    );

    for _ in 0..10 {
        h.bridge.tick();
        if h.bridge.state() == BridgeState::Connected {
            break;
        }
    }
    assert_eq!(h.bridge.state(), BridgeState::Connected);

    let failed = h.bus.published_on(&topic("egun/confailed"));
    assert_eq!(failed.len(), 1);
    assert!(failed[0].payload_str().contains("No such file or directory"));

    assert!(h.bridge.queue().is_empty());
    assert_eq!(
        second.written_commands(),
        vec![
            "$$$id\n".to_string(),
            "$$$psugetv1\n".to_string(),
            "$$$psugeta3\n".to_string(),
            "$$$psugetv2\n".to_string(),
        ]
    );
    assert!(wait_until(|| h.bus.published_on(&topic("egun/voltage")).len() == 2));
}

#[test]
fn test_invalid_requests_are_dropped() {
    let mut h = harness(vec![]);
    h.bridge.tick();

    h.bus.inject(&topic("egun/voltage/request"), br#"{"channel":9}"#);
    h.bus.inject(&topic("egun/current/request"), b"not json");
    h.bus.inject(&topic("egun/id/request"), b"not json either");

    assert_eq!(h.bridge.queue().pending(), vec![QueuedCommand::Identify]);
}

#[test]
fn test_full_queue_reports_error() {
    let mut h = harness(vec![]);
    h.bridge = h.bridge.with_queue_capacity(2);
    h.bridge.tick();

    for ch in 1..=3 {
        let payload = format!(r#"{{"channel":{}}}"#, ch);
        h.bus.inject(&topic("egun/voltage/request"), payload.as_bytes());
    }

    assert_eq!(
        h.bridge.queue().pending(),
        vec![QueuedCommand::GetVoltage(2), QueuedCommand::GetVoltage(3)]
    );
    let errors = h.bus.published_on(&topic("error"));
    assert_eq!(errors.len(), 1);
    assert!(errors[0].payload_str().contains("getv 1"));
}

#[test]
fn test_keepalive_when_idle() {
    let mut h = harness(vec![Some(device())]);
    h.bridge.tick();
    h.bus.clear_published();

    h.bridge.tick();
    assert_eq!(h.bus.published_on(&topic("keepalive")).len(), 1);

    h.bus.inject(&topic("egun/id/request"), b"");
    h.bus.clear_published();
    h.bridge.tick();
    assert!(h.bus.published_on(&topic("keepalive")).is_empty());
}

#[test]
fn test_bad_reload_keeps_previous_config() {
    let mut h = harness(vec![Some(device())]);
    h.bridge.tick();
    assert_eq!(h.bus.connect_count(), 1);

    fs::write(&h.path, r#"{"egun": {"port": "/dev/ttyU0"}, "mqtt": {"broker": "x"}}"#).unwrap();
    h.bridge.control().request_reload();
    h.bridge.tick();

    assert_eq!(h.bus.connect_count(), 1);
    assert_eq!(h.bridge.config().map(|c| c.mqtt.broker.as_str()), Some("localhost"));
    assert_eq!(h.bridge.state(), BridgeState::Connected);
    assert_eq!(h.bus.published_on(&topic("config/reload")).len(), 1);
    assert!(h.bus.published_on(&topic("config/reloaded")).is_empty());
}

#[test]
fn test_reload_switches_basetopic() {
    let mut h = harness(vec![Some(device())]);
    h.bridge.tick();

    fs::write(&h.path, config_json("lab2")).unwrap();
    h.bridge.control().request_reload();
    h.bridge.tick();

    assert_eq!(h.bus.connect_count(), 2);
    assert_eq!(h.bridge.publisher().basetopic().as_deref(), Some("lab2/"));
    assert_eq!(h.bus.published_on(&topic("config/reloaded")).len(), 1);
    assert_eq!(h.bus.published_on("lab2/connected").len(), 1);
    assert_eq!(h.bus.published_on("lab2/keepalive").len(), 1);
    // Same device settings, so the device stays open
    assert_eq!(h.bridge.state(), BridgeState::Connected);
}

#[test]
fn test_shutdown_powers_off_and_disconnects() {
    let sim = device();
    let mut h = harness(vec![Some(sim.clone())]);
    h.bridge.tick();
    sim.clear_writes();

    h.bridge.control().request_terminate();
    assert!(!h.bridge.tick());
    h.bridge.shutdown();

    assert_eq!(h.bridge.state(), BridgeState::ShuttingDown);
    assert_eq!(sim.written_commands(), vec!["$$$off\n".to_string()]);
    assert!(sim.is_closed());
    assert!(!h.bridge.publisher().is_connected());
}

#[test]
fn test_spawned_bridge_stops_on_terminate() {
    let sim = device();
    let h = harness(vec![Some(sim.clone())]);
    let control = h.bridge.control();
    let bus = h.bus.clone();

    let worker = h.bridge.spawn().unwrap();
    assert!(wait_until(|| !bus.published_on(&topic("egun/connected")).is_empty()));

    control.request_terminate();
    worker.join().unwrap();
    assert!(sim.is_closed());
}
