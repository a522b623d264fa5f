//! Message bus abstraction
//!
//! The orchestrator talks to the broker through [`BusConnector`] and
//! [`BusClient`]; the MQTT implementation lives in [`crate::mqtt`], an
//! in-memory one for tests in [`crate::memory`].

use crate::error::BusError;
use egunctl_core::{thread_safe_rw, ThreadSafeRw};
use egunctl_settings::MqttSettings;
use serde::Serialize;
use std::sync::Arc;

/// Message received from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Called on the bus client's delivery thread for every incoming message
pub type MessageHandler = Arc<dyn Fn(BusMessage) + Send + Sync>;

/// Connected bus client
pub trait BusClient: Send + Sync {
    /// Publish `payload` on the absolute `topic` with QoS 0
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), BusError>;

    /// Disconnect from the broker. Idempotent.
    fn disconnect(&self);
}

/// Creates bus clients from broker settings
pub trait BusConnector: Send + Sync {
    /// Start a client. Once the broker accepts the session the client
    /// subscribes to `<basetopic>#` and publishes `<basetopic>connected`.
    fn connect(
        &self,
        settings: &MqttSettings,
        handler: MessageHandler,
    ) -> Result<Arc<dyn BusClient>, BusError>;
}

#[derive(Clone)]
struct Active {
    client: Arc<dyn BusClient>,
    basetopic: String,
}

/// Shared handle used by the orchestrator and the device observers to
/// publish under the current base topic
#[derive(Clone)]
pub struct Publisher {
    active: ThreadSafeRw<Option<Active>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self {
            active: thread_safe_rw(None),
        }
    }

    /// Install a new client and base topic, returning the previous client
    pub fn replace(
        &self,
        client: Arc<dyn BusClient>,
        basetopic: impl Into<String>,
    ) -> Option<Arc<dyn BusClient>> {
        let next = Active {
            client,
            basetopic: basetopic.into(),
        };
        self.active.write().replace(next).map(|a| a.client)
    }

    /// Remove the current client
    pub fn take(&self) -> Option<Arc<dyn BusClient>> {
        self.active.write().take().map(|a| a.client)
    }

    pub fn is_connected(&self) -> bool {
        self.active.read().is_some()
    }

    pub fn basetopic(&self) -> Option<String> {
        self.active.read().as_ref().map(|a| a.basetopic.clone())
    }

    /// Publish a JSON body on `<basetopic><suffix>`
    pub fn publish_json<T: Serialize>(&self, suffix: &str, body: &T, retain: bool) -> bool {
        match serde_json::to_vec(body) {
            Ok(payload) => self.publish_raw(suffix, &payload, retain),
            Err(e) => {
                tracing::error!("Failed to encode payload for {}: {}", suffix, e);
                false
            }
        }
    }

    /// Publish an empty message on `<basetopic><suffix>`
    pub fn publish_empty(&self, suffix: &str) -> bool {
        self.publish_raw(suffix, &[], false)
    }

    fn publish_raw(&self, suffix: &str, payload: &[u8], retain: bool) -> bool {
        // Clone out of the lock so a slow client never blocks a reload
        let Some(active) = self.active.read().clone() else {
            tracing::warn!("Dropping message to {} - no MQTT connection", suffix);
            return false;
        };

        let topic = format!("{}{}", active.basetopic, suffix);
        match active.client.publish(&topic, payload, retain) {
            Ok(()) => {
                tracing::debug!("MQTT: Published to {}", topic);
                true
            }
            Err(e) => {
                tracing::error!("MQTT publish failed: {}", e);
                false
            }
        }
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBus;
    use crate::topics::VoltagePayload;

    #[test]
    fn test_publish_without_client() {
        let publisher = Publisher::new();
        assert!(!publisher.is_connected());
        assert!(!publisher.publish_empty("keepalive"));
    }

    #[test]
    fn test_publish_prefixes_basetopic() {
        let bus = MemoryBus::new();
        let publisher = Publisher::new();
        publisher.replace(bus.client(), "lab/");

        assert!(publisher.publish_json(
            "egun/voltage",
            &VoltagePayload {
                channel: 2,
                voltage: 1800
            },
            false
        ));
        let sent = bus.published();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "lab/egun/voltage");
        assert_eq!(sent[0].payload_str(), r#"{"channel":2,"voltage":1800}"#);
        assert!(!sent[0].retain);
    }

    #[test]
    fn test_replace_returns_previous() {
        let bus = MemoryBus::new();
        let publisher = Publisher::new();
        assert!(publisher.replace(bus.client(), "a/").is_none());
        assert!(publisher.replace(bus.client(), "b/").is_some());
        assert_eq!(publisher.basetopic().as_deref(), Some("b/"));
        assert!(publisher.take().is_some());
        assert!(!publisher.is_connected());
    }
}
