//! Message dispatcher
//!
//! Runs on the reader thread. Turns a frame payload into a
//! [`DeviceEvent`], calls the observers registered for its kind and then
//! hands it to the correlator under its filter key. Nothing in here can
//! fail the reader loop.

use crate::device::correlator::Correlator;
use crate::device::response_parser::ResponseParser;
use egunctl_core::{DeviceEvent, ObserverRegistry};
use std::sync::Arc;

/// Routes decoded frames to observers and the correlator
pub struct MessageDispatcher {
    parser: ResponseParser,
    observers: Arc<ObserverRegistry>,
    correlator: Arc<Correlator>,
}

impl MessageDispatcher {
    /// Create a dispatcher
    pub fn new(observers: Arc<ObserverRegistry>, correlator: Arc<Correlator>) -> Self {
        Self {
            parser: ResponseParser::new(),
            observers,
            correlator,
        }
    }

    /// Dispatch one frame payload. Returns the event it produced.
    pub fn dispatch(&self, payload: &[u8]) -> Option<DeviceEvent> {
        let text = String::from_utf8_lossy(payload);
        let event = self.parser.parse(&text)?;
        self.dispatch_event(&event);
        Some(event)
    }

    /// Deliver an already classified event
    pub fn dispatch_event(&self, event: &DeviceEvent) {
        tracing::trace!("Dispatching {}", event);
        self.observers.notify(event);
        if let Some(key) = event.filter_key() {
            if self.correlator.signal(&key, event) {
                tracing::trace!(filter = %key, "Synchronous wait satisfied");
            }
        }
    }
}
