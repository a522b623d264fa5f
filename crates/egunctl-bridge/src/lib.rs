//! # egunctl Bridge
//!
//! Publishes the electron source controller on an MQTT bus. Bus requests
//! are queued and executed by a single supervising loop; device replies
//! are published back under the configured base topic.

pub mod bus;
pub mod error;
pub mod memory;
pub mod mqtt;
pub mod orchestrator;
pub mod queue;
pub mod topics;

pub use bus::{BusClient, BusConnector, BusMessage, MessageHandler, Publisher};
pub use error::{BusError, RequestError};
pub use memory::{MemoryBus, Published};
pub use mqtt::{MqttBusClient, MqttBusConnector};
pub use orchestrator::{
    BridgeState, BridgeTiming, ControlHandle, DeviceConnector, Orchestrator,
    SerialDeviceConnector,
};
pub use queue::{CommandQueue, QueuedCommand, DEFAULT_QUEUE_CAPACITY};
