//! Single-slot request correlator
//!
//! The controller protocol carries no request ids, so at most one
//! synchronous request may be outstanding per connection. A caller arms
//! the slot with the filter key of the reply it expects, writes its
//! command and then blocks until the reader thread signals a matching
//! event, the wait times out, or the connection goes away.
//!
//! On timeout the last command is retransmitted while the retry budget
//! lasts. When it is exhausted a recovery probe is sent and the caller
//! gets [`WaitOutcome::NoResponse`].
//!
//! Callers must serialise their synchronous calls. A signal whose key does
//! not match the armed filter is dropped.

use egunctl_core::DeviceEvent;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Filter key of the beam-on reply, which gets the long timeout
pub const BEAM_ON_KEY: &str = "beamon";

/// Timeouts and retry budget of synchronous waits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelatorConfig {
    /// Time to wait for one reply
    pub reply_timeout: Duration,
    /// Time to wait for the beam to come up
    pub beam_on_timeout: Duration,
    /// Retransmissions of the last command before giving up
    pub retries: u32,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(10),
            beam_on_timeout: Duration::from_secs(1200),
            retries: 3,
        }
    }
}

/// What the correlator needs from the link while waiting
pub trait RetryLink {
    /// Write the last transmitted command again. Returns false if the
    /// transport is gone.
    fn retransmit_last(&self) -> bool;

    /// Best-effort command that makes the device answer with its identity
    fn send_probe(&self);
}

/// Result of a synchronous wait
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// The matching event
    Reply(DeviceEvent),
    /// Retries exhausted without an answer
    NoResponse,
    /// The connection closed while waiting
    Abandoned,
}

#[derive(Default)]
struct WaitSlot {
    filter: Option<String>,
    response: Option<DeviceEvent>,
    abandoned: bool,
}

/// Wait/signal slot shared by the reader thread and one caller
pub struct Correlator {
    config: CorrelatorConfig,
    slot: Mutex<WaitSlot>,
    cond: Condvar,
}

impl Correlator {
    /// Create a correlator
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            config,
            slot: Mutex::new(WaitSlot::default()),
            cond: Condvar::new(),
        }
    }

    /// Timeouts and retries in use
    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    fn timeout_for(&self, key: &str) -> Duration {
        if key == BEAM_ON_KEY {
            self.config.beam_on_timeout
        } else {
            self.config.reply_timeout
        }
    }

    /// Arm the slot for `key`. Must happen before the command is written
    /// so that an immediate reply is not lost.
    pub fn expect(&self, key: impl Into<String>) {
        let mut slot = self.slot.lock();
        slot.filter = Some(key.into());
        slot.response = None;
    }

    /// Filter key currently armed
    pub fn pending_filter(&self) -> Option<String> {
        self.slot.lock().filter.clone()
    }

    /// Arm the slot for `key` and wait for it
    pub fn begin_wait(&self, key: impl Into<String>, link: &dyn RetryLink) -> WaitOutcome {
        self.expect(key);
        self.wait(link)
    }

    /// Block until the armed filter is satisfied, retries run out or the
    /// slot is abandoned. The filter is cleared on every exit path.
    pub fn wait(&self, link: &dyn RetryLink) -> WaitOutcome {
        let mut slot = self.slot.lock();
        let Some(key) = slot.filter.clone() else {
            return WaitOutcome::NoResponse;
        };
        let timeout = self.timeout_for(&key);
        let mut retries_left = self.config.retries;

        loop {
            if let Some(outcome) = Self::settled(&mut slot) {
                return outcome;
            }

            let deadline = Instant::now() + timeout;
            while slot.response.is_none() && !slot.abandoned {
                if self.cond.wait_until(&mut slot, deadline).timed_out() {
                    break;
                }
            }
            if let Some(outcome) = Self::settled(&mut slot) {
                return outcome;
            }

            if retries_left > 0 {
                retries_left -= 1;
                tracing::warn!(
                    filter = %key,
                    "Timeout while waiting for reply, {} retries left",
                    retries_left
                );
                let sent = MutexGuard::unlocked(&mut slot, || link.retransmit_last());
                if !sent {
                    slot.filter = None;
                    slot.response = None;
                    return WaitOutcome::Abandoned;
                }
                continue;
            }

            tracing::warn!(filter = %key, "No response, sending recovery probe");
            slot.filter = None;
            MutexGuard::unlocked(&mut slot, || link.send_probe());
            // A late reply may have raced the probe; it is not ours anymore
            slot.response = None;
            return WaitOutcome::NoResponse;
        }
    }

    fn settled(slot: &mut WaitSlot) -> Option<WaitOutcome> {
        if slot.abandoned {
            slot.filter = None;
            slot.response = None;
            return Some(WaitOutcome::Abandoned);
        }
        let event = slot.response.take()?;
        slot.filter = None;
        Some(WaitOutcome::Reply(event))
    }

    /// Deliver an event. Returns true if it satisfied the armed filter.
    pub fn signal(&self, key: &str, event: &DeviceEvent) -> bool {
        let mut slot = self.slot.lock();
        if slot.filter.as_deref() != Some(key) || slot.response.is_some() {
            return false;
        }
        slot.response = Some(event.clone());
        self.cond.notify_all();
        true
    }

    /// Disarm the slot without waiting
    pub fn cancel(&self) {
        let mut slot = self.slot.lock();
        slot.filter = None;
        slot.response = None;
    }

    /// Wake any waiter with [`WaitOutcome::Abandoned`]; later waits end
    /// immediately the same way
    pub fn abandon(&self) {
        let mut slot = self.slot.lock();
        slot.abandoned = true;
        self.cond.notify_all();
    }

    /// True once [`Correlator::abandon`] was called
    pub fn is_abandoned(&self) -> bool {
        self.slot.lock().abandoned
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(CorrelatorConfig::default())
    }
}
