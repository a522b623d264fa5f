//! MQTT bus client built on `rumqttc`
//!
//! Each client owns a single-threaded tokio runtime on its own thread that
//! drives the rumqttc event loop. Requests to the client (publish,
//! subscribe, disconnect) go through the non-blocking `try_*` calls so they
//! can be made from any thread, including the event loop itself.

use crate::bus::{BusClient, BusConnector, BusMessage, MessageHandler};
use crate::error::BusError;
use crate::topics;
use egunctl_settings::MqttSettings;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::Notify;

/// Pending requests the client buffers before `try_publish` fails
const REQUEST_CAPACITY: usize = 64;

/// Pause before the event loop retries a failed broker connection
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Upper bound for flushing the DISCONNECT packet on shutdown
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Creates [`MqttBusClient`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttBusConnector;

impl BusConnector for MqttBusConnector {
    fn connect(
        &self,
        settings: &MqttSettings,
        handler: MessageHandler,
    ) -> Result<Arc<dyn BusClient>, BusError> {
        let client = MqttBusClient::connect(settings, handler)?;
        Ok(Arc::new(client))
    }
}

/// Client of one broker session
pub struct MqttBusClient {
    client: AsyncClient,
    shutdown: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBusClient {
    /// Start the event loop thread and begin connecting to the broker
    pub fn connect(settings: &MqttSettings, handler: MessageHandler) -> Result<Self, BusError> {
        let broker = format!("{}:{}", settings.broker, settings.port);
        let connect_error = |reason: String| BusError::Connect {
            broker: broker.clone(),
            reason,
        };

        let mut options = MqttOptions::new(settings.client_id(), settings.broker.clone(), settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keepalive_secs));
        if !settings.user.is_empty() {
            options.set_credentials(settings.user.clone(), settings.password.clone());
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| connect_error(e.to_string()))?;

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let shutdown = Arc::new(Notify::new());

        let session = Session {
            client: client.clone(),
            basetopic: settings.basetopic.clone(),
            broker: broker.clone(),
            user: settings.user.clone(),
            handler,
        };
        let stop = shutdown.clone();
        let worker = thread::Builder::new()
            .name("mqtt-bus".to_string())
            .spawn(move || runtime.block_on(session.run(event_loop, stop)))
            .map_err(|e| connect_error(e.to_string()))?;

        tracing::info!("MQTT client for {} started", broker);
        Ok(Self {
            client,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }
}

impl BusClient for MqttBusClient {
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), BusError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, retain, payload.to_vec())
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn disconnect(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!("MQTT disconnect request failed: {}", e);
        }
        self.shutdown.notify_one();
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            tracing::error!("MQTT event loop thread panicked");
        }
    }
}

impl Drop for MqttBusClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct Session {
    client: AsyncClient,
    basetopic: String,
    broker: String,
    user: String,
    handler: MessageHandler,
}

impl Session {
    async fn run(self, mut event_loop: EventLoop, shutdown: Arc<Notify>) {
        tracing::debug!("MQTT event loop started for {}", self.broker);

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    flush_disconnect(&mut event_loop).await;
                    break;
                }
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => self.on_connack(ack.code),
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        (self.handler)(BusMessage::new(publish.topic, publish.payload.to_vec()));
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(
                            "Failed connecting to {} as {}, retrying: {}",
                            self.broker,
                            self.user,
                            e
                        );
                        tokio::select! {
                            _ = shutdown.notified() => break,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                    }
                },
            }
        }

        tracing::debug!("MQTT event loop for {} stopped", self.broker);
    }

    fn on_connack(&self, code: ConnectReturnCode) {
        if code != ConnectReturnCode::Success {
            tracing::error!(
                "Failed connecting to {} as {}: {:?}",
                self.broker,
                self.user,
                code
            );
            return;
        }

        tracing::debug!("Connected to {} as {}", self.broker, self.user);
        let filter = format!("{}#", self.basetopic);
        match self.client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
            Ok(()) => tracing::debug!("Subscribed to {}", filter),
            Err(e) => tracing::error!("Subscribing to {} failed: {}", filter, e),
        }

        let topic = format!("{}{}", self.basetopic, topics::CONNECTED);
        if let Err(e) = self
            .client
            .try_publish(topic, QoS::AtMostOnce, false, Vec::new())
        {
            tracing::error!("MQTT publish failed: {}", e);
        }
    }
}

async fn flush_disconnect(event_loop: &mut EventLoop) {
    let flush = async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    if tokio::time::timeout(DISCONNECT_GRACE, flush).await.is_err() {
        tracing::debug!("MQTT disconnect not flushed in time");
    }
}
