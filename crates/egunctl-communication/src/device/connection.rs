//! Connection to one electron source controller
//!
//! A `Connection` owns the transport, the background reader thread (with
//! its receive buffer and frame decoder), the observer registry, the
//! correlator and the [`CommandLayer`]. Dropping it closes it.
//!
//! The reader thread reads, decodes and dispatches inline. Observers run
//! on that thread and must not issue blocking commands on the same
//! connection: the reply they would wait for can only be delivered by the
//! thread they are blocking.

use crate::communication::frame_decoder::FrameDecoder;
use crate::communication::ring_buffer::{OverflowPolicy, RingBuffer, DEFAULT_CAPACITY};
use crate::communication::serial::SerialTransport;
use crate::communication::{ConnectionParams, ReadOutcome, Transport};
use crate::device::controller::{CallMode, CommandLayer};
use crate::device::correlator::{Correlator, CorrelatorConfig};
use crate::device::dispatcher::MessageDispatcher;
use egunctl_core::{DeviceEvent, Error, EventKind, ObserverHandle, ObserverRegistry, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Timing and buffering of one connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Wait for one reply
    pub reply_timeout: Duration,
    /// Wait for the beam-on reply
    pub beam_on_timeout: Duration,
    /// Retransmissions before a wait gives up
    pub retries: u32,
    /// Settle time after voltage, current and filament changes in
    /// blocking mode
    pub stabilization_delay: Duration,
    /// Settle time after a polarity change in blocking mode
    pub polarity_settle: Duration,
    /// Pause after `off` so the command leaves the serial buffer
    pub off_flush: Duration,
    /// Reboot time after `reset` in blocking mode
    pub reset_reboot: Duration,
    /// Pause after storing target voltages or current limits
    pub limits_settle: Duration,
    /// A set voltage counts as reached within this many volts
    pub voltage_tolerance: i64,
    /// Upper bound for a blocking voltage change to converge
    pub voltage_convergence_timeout: Duration,
    /// Pause between unanswered convergence polls
    pub convergence_poll: Duration,
    /// Receive buffer slots
    pub buffer_capacity: usize,
    /// What the receive buffer does when full
    pub overflow_policy: OverflowPolicy,
    /// Send `off` when the connection is closed
    pub shutdown_on_close: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(10),
            beam_on_timeout: Duration::from_secs(1200),
            retries: 3,
            stabilization_delay: Duration::from_secs(5),
            polarity_settle: Duration::from_secs(20),
            off_flush: Duration::from_secs(2),
            reset_reboot: Duration::from_secs(10),
            limits_settle: Duration::from_secs(5),
            voltage_tolerance: 5,
            voltage_convergence_timeout: Duration::from_secs(120),
            convergence_poll: Duration::from_secs(1),
            buffer_capacity: DEFAULT_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            shutdown_on_close: false,
        }
    }
}

impl ConnectionConfig {
    /// Same timeouts, no settle delays
    pub fn without_delays(self) -> Self {
        Self {
            stabilization_delay: Duration::ZERO,
            polarity_settle: Duration::ZERO,
            off_flush: Duration::ZERO,
            reset_reboot: Duration::ZERO,
            limits_settle: Duration::ZERO,
            convergence_poll: Duration::ZERO,
            ..self
        }
    }

    /// Correlator part of this configuration
    pub fn correlator_config(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            reply_timeout: self.reply_timeout,
            beam_on_timeout: self.beam_on_timeout,
            retries: self.retries,
        }
    }
}

/// Open link to the controller
pub struct Connection {
    transport: Arc<dyn Transport>,
    observers: Arc<ObserverRegistry>,
    correlator: Arc<Correlator>,
    open: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    commands: CommandLayer,
    shutdown_on_close: bool,
}

impl Connection {
    /// Open the serial port described by `params`
    pub fn open(params: &ConnectionParams, config: ConnectionConfig) -> Result<Self> {
        let transport = SerialTransport::open(params)?;
        Self::with_transport(Arc::new(transport), config)
    }

    /// Start a connection over an already open transport
    pub fn with_transport(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Result<Self> {
        let observers = Arc::new(ObserverRegistry::new());
        let correlator = Arc::new(Correlator::new(config.correlator_config()));
        let open = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));

        let decoder = FrameDecoder::new(RingBuffer::with_policy(
            config.buffer_capacity,
            config.overflow_policy,
        ));
        let dispatcher = MessageDispatcher::new(observers.clone(), correlator.clone());

        let reader = {
            let transport = transport.clone();
            let correlator = correlator.clone();
            let open = open.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("egun-reader".to_string())
                .spawn(move || {
                    reader_loop(transport.as_ref(), decoder, &dispatcher, &stop);
                    open.store(false, Ordering::SeqCst);
                    correlator.abandon();
                })
                .map_err(Error::Io)?
        };

        tracing::info!("Connection to {} established", transport.name());

        let shutdown_on_close = config.shutdown_on_close;
        let commands = CommandLayer::new(transport.clone(), correlator.clone(), open.clone(), config);
        Ok(Self {
            transport,
            observers,
            correlator,
            open,
            stop,
            closed: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
            commands,
            shutdown_on_close,
        })
    }

    /// Transport name (port path)
    pub fn port_name(&self) -> String {
        self.transport.name()
    }

    /// True until closed or the transport fails
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Command API of this connection
    pub fn commands(&self) -> &CommandLayer {
        &self.commands
    }

    /// Register an observer for one event kind
    pub fn subscribe<F>(&self, kind: EventKind, observer: F) -> ObserverHandle
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(kind, observer)
    }

    /// Remove an observer
    pub fn unsubscribe(&self, handle: ObserverHandle) -> bool {
        self.observers.unsubscribe(handle)
    }

    /// Observer registry shared with the reader thread
    pub fn observers(&self) -> &Arc<ObserverRegistry> {
        &self.observers
    }

    /// Close the connection. Idempotent.
    ///
    /// Sends a best-effort `off` first if configured, wakes any blocked
    /// caller with `NotConnected`, joins the reader thread and only then
    /// releases the transport.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.shutdown_on_close && self.is_open() {
            if let Err(e) = self.commands.off(CallMode::Blocking) {
                tracing::debug!("Power off on close failed: {}", e);
            }
        }

        self.stop.store(true, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        self.correlator.abandon();

        if let Some(handle) = self.reader.lock().take() {
            if handle.thread().id() == thread::current().id() {
                tracing::debug!("Connection closed from its reader thread");
            } else if handle.join().is_err() {
                tracing::error!("Reader thread panicked");
            }
        }

        self.transport.close();
        tracing::info!("Connection to {} closed", self.transport.name());
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn reader_loop(
    transport: &dyn Transport,
    mut decoder: FrameDecoder,
    dispatcher: &MessageDispatcher,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::SeqCst) {
        match transport.read_byte() {
            ReadOutcome::Byte(byte) => {
                if let Some(frame) = decoder.push_byte(byte) {
                    dispatcher.dispatch(&frame);
                }
            }
            ReadOutcome::Idle => {}
            ReadOutcome::Closed => {
                if !stop.load(Ordering::SeqCst) {
                    tracing::warn!("Transport {} closed", transport.name());
                }
                break;
            }
        }
    }
    tracing::debug!("Reader thread exiting");
}
