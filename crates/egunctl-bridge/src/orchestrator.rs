//! Supervising loop of the MQTT bridge
//!
//! The orchestrator owns the configuration, the bus client and the device
//! connection. Each [`Orchestrator::tick`] is one iteration of the loop:
//! apply a pending reload, (re)open the device when it is due, wait for bus
//! activity (publishing a keepalive if there was none) and drain the
//! command queue.
//!
//! ```text
//! NoConfig -> Connecting -> Connected
//!                 ^  |          |
//!                 |  v          v
//!             Reconnecting <----+
//! ```
//!
//! Termination moves any state to `ShuttingDown`.

use crate::bus::{BusConnector, BusMessage, MessageHandler, Publisher};
use crate::queue::{CommandQueue, QueuedCommand, DEFAULT_QUEUE_CAPACITY};
use crate::topics::{
    self, ConFailedPayload, CurrentPayload, ErrorPayload, IdPayload, PortPayload, VoltagePayload,
};
use egunctl_communication::{CallMode, Connection, ConnectionConfig, ConnectionParams, Response};
use egunctl_core::{DeviceEvent, Error, EventKind, Result};
use egunctl_settings::{BridgeConfig, ConfigSource, DeviceSettings};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Lifecycle state of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// No valid configuration loaded yet
    NoConfig,
    /// Opening the device and waiting for its identification
    Connecting,
    /// Device open and identified; queued commands are executed
    Connected,
    /// Device lost or never reached; waiting for the next attempt
    Reconnecting,
    /// Termination requested
    ShuttingDown,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoConfig => "no-config",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::ShuttingDown => "shutting-down",
        };
        f.write_str(name)
    }
}

/// Pacing of the supervising loop
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeTiming {
    /// How long one iteration waits for bus activity
    pub loop_wait: Duration,
    /// Iterations between two device open attempts
    pub reconnect_countdown: u32,
    /// Pause after every device command taken from the queue
    pub command_throttle: Duration,
    /// Pause between opening the port and identifying the device
    pub connect_settle: Duration,
}

impl Default for BridgeTiming {
    fn default() -> Self {
        Self {
            loop_wait: Duration::from_secs(1),
            reconnect_countdown: 10,
            command_throttle: Duration::from_millis(200),
            connect_settle: Duration::from_secs(10),
        }
    }
}

/// Opens device connections for the bridge
pub trait DeviceConnector: Send + Sync {
    fn open(&self, settings: &DeviceSettings) -> Result<Connection>;
}

/// Opens the serial port named in the configuration
#[derive(Debug, Clone, Default)]
pub struct SerialDeviceConnector {
    base: ConnectionConfig,
}

impl SerialDeviceConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `base` for everything the configuration file does not set
    pub fn with_config(base: ConnectionConfig) -> Self {
        Self { base }
    }

    /// Link timing for `settings`
    pub fn connection_config(&self, settings: &DeviceSettings) -> ConnectionConfig {
        ConnectionConfig {
            retries: settings.retries,
            stabilization_delay: Duration::from_secs(settings.stabilization_delay_secs),
            // The bridge powers the device off itself on terminate
            shutdown_on_close: false,
            ..self.base.clone()
        }
    }
}

impl DeviceConnector for SerialDeviceConnector {
    fn open(&self, settings: &DeviceSettings) -> Result<Connection> {
        let params = ConnectionParams::serial(settings.port.clone()).with_baud_rate(settings.baudrate);
        Connection::open(&params, self.connection_config(settings))
    }
}

/// Terminate and reload flags, shared with signal handlers
#[derive(Debug, Clone)]
pub struct ControlHandle {
    terminate: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
}

impl ControlHandle {
    /// A fresh handle has a reload pending so the first iteration loads
    /// the configuration
    pub fn new() -> Self {
        Self {
            terminate: Arc::new(AtomicBool::new(false)),
            reload: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
    }

    pub fn is_terminating(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// Consume a pending reload request
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// The bridge between the bus and one electron source controller
pub struct Orchestrator {
    source: Box<dyn ConfigSource>,
    bus: Arc<dyn BusConnector>,
    devices: Box<dyn DeviceConnector>,
    timing: BridgeTiming,
    control: ControlHandle,
    publisher: Publisher,
    queue: Arc<CommandQueue>,
    config: Option<BridgeConfig>,
    connection: Option<Connection>,
    state: BridgeState,
    countdown: u32,
}

impl Orchestrator {
    pub fn new(
        source: Box<dyn ConfigSource>,
        bus: Arc<dyn BusConnector>,
        devices: Box<dyn DeviceConnector>,
    ) -> Self {
        let timing = BridgeTiming::default();
        Self {
            source,
            bus,
            devices,
            countdown: timing.reconnect_countdown,
            timing,
            control: ControlHandle::new(),
            publisher: Publisher::new(),
            queue: Arc::new(CommandQueue::new(DEFAULT_QUEUE_CAPACITY)),
            config: None,
            connection: None,
            state: BridgeState::NoConfig,
        }
    }

    pub fn with_timing(mut self, timing: BridgeTiming) -> Self {
        self.countdown = timing.reconnect_countdown;
        self.timing = timing;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue = Arc::new(CommandQueue::new(capacity));
        self
    }

    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn config(&self) -> Option<&BridgeConfig> {
        self.config.as_ref()
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// Run the loop on a dedicated thread until termination
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("egun-bridge".to_string())
            .spawn(move || self.run())
    }

    /// Run the loop on the current thread until termination
    pub fn run(mut self) {
        tracing::info!("Service running");
        while self.tick() {}
        self.shutdown();
    }

    /// One iteration of the supervising loop. Returns false once
    /// termination was requested.
    pub fn tick(&mut self) -> bool {
        if self.control.take_reload() {
            self.reload();
        }
        if self.control.is_terminating() {
            return false;
        }

        self.check_link();
        self.supervise_device();

        if !self.queue.wait_for_activity(self.timing.loop_wait) {
            self.publisher.publish_empty(topics::KEEPALIVE);
        }

        self.drain_queue();
        !self.control.is_terminating()
    }

    /// Disconnect the bus, power the device off and close it
    pub fn shutdown(&mut self) {
        self.state = BridgeState::ShuttingDown;

        if let Some(client) = self.publisher.take() {
            client.disconnect();
        }

        if let Some(conn) = self.connection.take() {
            let power_off = self
                .config
                .as_ref()
                .is_none_or(|c| c.egun.shutdown_on_terminate);
            if power_off && conn.is_open() {
                if let Err(e) = conn.commands().off(CallMode::NonBlocking) {
                    tracing::warn!("Power off on shutdown failed: {}", e);
                }
            }
            conn.close();
        }

        tracing::info!("Shutting down due to user request");
    }

    fn reload(&mut self) {
        self.publisher.publish_empty(topics::CONFIG_RELOAD);

        let config = match self.source.load() {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(
                    "Failed to load configuration {}: {}",
                    self.source.describe(),
                    e
                );
                return;
            }
        };
        tracing::debug!("Loaded new configuration file {}", self.source.describe());

        self.countdown = 1;
        self.publisher.publish_empty(topics::CONFIG_RELOADED);

        if let Some(old) = self.publisher.take() {
            old.disconnect();
        }
        let handler = request_handler(
            config.mqtt.basetopic.clone(),
            self.queue.clone(),
            self.publisher.clone(),
        );
        match self.bus.connect(&config.mqtt, handler) {
            Ok(client) => {
                self.publisher.replace(client, config.mqtt.basetopic.clone());
            }
            Err(e) => tracing::error!("{}", e),
        }

        let device_changed = self
            .config
            .as_ref()
            .is_some_and(|old| old.egun != config.egun);
        if device_changed {
            if let Some(conn) = self.connection.take() {
                tracing::info!("Device settings changed, closing {}", conn.port_name());
                conn.close();
            }
        }

        if self.connection.is_none() {
            self.state = BridgeState::Connecting;
        }
        self.config = Some(config);
    }

    fn check_link(&mut self) {
        if self.connection.as_ref().is_some_and(|c| !c.is_open()) {
            self.link_lost("transport closed");
        }
    }

    fn link_lost(&mut self, reason: &str) {
        if let Some(conn) = self.connection.take() {
            tracing::warn!("Lost electron gun on {}: {}", conn.port_name(), reason);
            conn.close();
        }
        self.state = BridgeState::Reconnecting;
        self.countdown = self.timing.reconnect_countdown.max(1);

        if let Some(config) = &self.config {
            let port = PortPayload {
                port: config.egun.port.clone(),
            };
            self.publisher.publish_json(topics::EGUN_RECONNECTING, &port, false);
        }
    }

    fn supervise_device(&mut self) {
        if self.connection.is_some() {
            return;
        }
        let Some(settings) = self.config.as_ref().map(|c| c.egun.clone()) else {
            return;
        };

        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown > 0 {
            return;
        }
        self.countdown = self.timing.reconnect_countdown.max(1);
        self.connect_device(&settings);
    }

    fn connect_device(&mut self, settings: &DeviceSettings) {
        self.state = BridgeState::Connecting;
        let port = PortPayload {
            port: settings.port.clone(),
        };
        self.publisher.publish_json(topics::EGUN_RECONNECTING, &port, false);
        tracing::debug!("Trying to reconnect to electron gun at {}", settings.port);

        match self.open_and_identify(settings) {
            Ok(conn) => {
                tracing::info!("Electron gun connected on {}", settings.port);
                self.connection = Some(conn);
                self.state = BridgeState::Connected;
                self.publisher.publish_json(topics::EGUN_CONNECTED, &port, false);
            }
            Err(e) => {
                tracing::error!("Failed to connect to electron gun: {}", e);
                self.state = BridgeState::Reconnecting;
                let failed = ConFailedPayload {
                    port: settings.port.clone(),
                    exception: e.to_string(),
                };
                self.publisher.publish_json(topics::EGUN_CONFAILED, &failed, false);
            }
        }
    }

    fn open_and_identify(&self, settings: &DeviceSettings) -> Result<Connection> {
        let conn = self.devices.open(settings)?;
        self.attach_observers(&conn);

        if !self.timing.connect_settle.is_zero() {
            thread::sleep(self.timing.connect_settle);
        }

        match conn.commands().identify(CallMode::Blocking)? {
            Response::Value(_) => Ok(conn),
            _ => Err(Error::other("No identification from electron gun")),
        }
    }

    fn attach_observers(&self, conn: &Connection) {
        let publisher = self.publisher.clone();
        conn.subscribe(EventKind::Identify, move |ev| {
            if let DeviceEvent::Identify {
                version_date,
                version_rev,
            } = ev
            {
                tracing::debug!(
                    "Received ID response. Version: {}, Revision: {}",
                    version_date,
                    version_rev
                );
                let body = IdPayload {
                    version: version_date.clone(),
                    revision: version_rev.clone(),
                };
                publisher.publish_json(topics::EGUN_ID, &body, true);
            }
        });

        let publisher = self.publisher.clone();
        conn.subscribe(EventKind::Voltage, move |ev| {
            if let DeviceEvent::Voltage { channel, value } = ev {
                tracing::debug!("Received voltage response: Channel {}: {}", channel, value);
                let body = VoltagePayload {
                    channel: *channel,
                    voltage: *value,
                };
                publisher.publish_json(topics::EGUN_VOLTAGE, &body, false);
            }
        });

        let publisher = self.publisher.clone();
        conn.subscribe(EventKind::Current, move |ev| {
            if let DeviceEvent::Current { channel, value } = ev {
                tracing::debug!("Received current response: Channel {}: {}", channel, value);
                let body = CurrentPayload {
                    channel: *channel,
                    current: *value,
                };
                publisher.publish_json(topics::EGUN_CURRENT, &body, false);
            }
        });
    }

    fn drain_queue(&mut self) {
        if self.state != BridgeState::Connected {
            if !self.queue.is_empty() {
                tracing::debug!(
                    "{} command(s) waiting for the electron gun",
                    self.queue.len()
                );
            }
            return;
        }

        while let Some(command) = self.queue.pop() {
            let result = match &self.connection {
                Some(conn) => execute(conn, command),
                None => Err(egunctl_core::DeviceError::NotConnected.into()),
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_link_down() => {
                    self.queue.requeue_front(command);
                    self.link_lost(&e.to_string());
                    break;
                }
                Err(e) => {
                    tracing::error!("Command {} failed: {}", command, e);
                    let body = ErrorPayload::new(format!("Command {} failed: {}", command, e));
                    self.publisher.publish_json(topics::ERROR, &body, false);
                }
            }

            // Crude rate limiting
            if !self.timing.command_throttle.is_zero() {
                thread::sleep(self.timing.command_throttle);
            }
            if self.control.is_terminating() {
                break;
            }
        }
    }
}

/// Replies arrive through the observers, so requests do not wait
fn execute(conn: &Connection, command: QueuedCommand) -> Result<()> {
    let commands = conn.commands();
    match command {
        QueuedCommand::Identify => commands.identify(CallMode::NonBlocking).map(drop),
        QueuedCommand::GetVoltage(ch) => commands.get_voltage(ch, CallMode::NonBlocking).map(drop),
        QueuedCommand::GetCurrent(ch) => commands.get_current(ch, CallMode::NonBlocking).map(drop),
    }
}

fn request_handler(
    basetopic: String,
    queue: Arc<CommandQueue>,
    publisher: Publisher,
) -> MessageHandler {
    Arc::new(move |msg: BusMessage| match topics::parse_request(&basetopic, &msg) {
        Ok(Some(command)) => {
            tracing::debug!("Received {} request", command);
            if let Some(dropped) = queue.push(command) {
                let message = format!("Command queue full, dropped {}", dropped);
                tracing::error!("{}", message);
                publisher.publish_json(topics::ERROR, &ErrorPayload::new(message), false);
            }
        }
        Ok(None) => {}
        Err(e) => tracing::error!("{}", e),
    })
}
