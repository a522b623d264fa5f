//! In-memory message bus
//!
//! `MemoryBus` records every publish and lets tests inject incoming
//! messages as if they came from the broker.

use crate::bus::{BusClient, BusConnector, BusMessage, MessageHandler};
use crate::error::BusError;
use crate::topics;
use egunctl_settings::MqttSettings;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One recorded publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Published {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Default)]
struct BusState {
    published: Vec<Published>,
    handler: Option<MessageHandler>,
    subscriptions: Vec<String>,
    connects: usize,
    fail_connect: bool,
}

/// Broker stand-in shared by all clients it creates
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

struct MemoryClient {
    state: Arc<Mutex<BusState>>,
    live: AtomicBool,
}

impl BusClient for MemoryClient {
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), BusError> {
        if !self.live.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }
        self.state.lock().published.push(Published {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
        });
        Ok(())
    }

    fn disconnect(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A live client that is not tied to a `connect` call
    pub fn client(&self) -> Arc<dyn BusClient> {
        Arc::new(MemoryClient {
            state: self.state.clone(),
            live: AtomicBool::new(true),
        })
    }

    /// Make the next connects fail
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    /// Number of successful connects
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().published.clone()
    }

    /// Publishes on exactly `topic`
    pub fn published_on(&self, topic: &str) -> Vec<Published> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear_published(&self) {
        self.state.lock().published.clear();
    }

    /// Deliver a message to the handler of the latest connect. Returns
    /// false if nobody is connected.
    pub fn inject(&self, topic: &str, payload: &[u8]) -> bool {
        let handler = self.state.lock().handler.clone();
        match handler {
            Some(handler) => {
                handler(BusMessage::new(topic, payload.to_vec()));
                true
            }
            None => false,
        }
    }
}

impl BusConnector for MemoryBus {
    fn connect(
        &self,
        settings: &MqttSettings,
        handler: MessageHandler,
    ) -> Result<Arc<dyn BusClient>, BusError> {
        {
            let mut state = self.state.lock();
            if state.fail_connect {
                return Err(BusError::Connect {
                    broker: format!("{}:{}", settings.broker, settings.port),
                    reason: "connection refused".to_string(),
                });
            }
            state.connects += 1;
            state.handler = Some(handler);
            state.subscriptions.push(settings.topic("#"));
        }

        let client = self.client();
        client.publish(&settings.topic(topics::CONNECTED), &[], false)?;
        Ok(client)
    }
}
