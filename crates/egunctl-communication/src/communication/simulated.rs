//! In-memory transport for tests and dry runs
//!
//! `SimulatedTransport` behaves like a serial port whose far end is a
//! scripted controller. Every written command is logged; an optional
//! responder turns the command into reply payloads that are framed and
//! queued for the reader.

use crate::communication::{ReadOutcome, Transport};
use egunctl_core::{ConnectionError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Produces reply payloads (without `$$$` and line feed) for one command
/// (without `$$$` and line feed)
pub type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

struct SimState {
    rx: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    responder: Option<Responder>,
    closed: bool,
    fail_writes: bool,
}

/// Virtual serial port backed by memory
pub struct SimulatedTransport {
    name: String,
    state: Mutex<SimState>,
    data_ready: Condvar,
    poll: Duration,
}

impl SimulatedTransport {
    /// Create a silent device: writes are logged, nothing is answered
    pub fn new() -> Self {
        Self {
            name: "simulated".to_string(),
            state: Mutex::new(SimState {
                rx: VecDeque::new(),
                writes: Vec::new(),
                responder: None,
                closed: false,
                fail_writes: false,
            }),
            data_ready: Condvar::new(),
            poll: Duration::from_millis(20),
        }
    }

    /// Create a device that answers through `responder`
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        let transport = Self::new();
        transport.set_responder(responder);
        transport
    }

    /// Create a device that behaves like a controller with four supplies.
    ///
    /// Answers `id`, `psugetv`, `psugeta`, `psumode`, `fila`, `setfila`,
    /// `insul`, `beamon`, `off` and `filon`/`filoff`, and remembers
    /// voltages set through `psusetv`.
    pub fn controller() -> Self {
        let mut voltages: HashMap<char, i64> = HashMap::new();
        Self::with_responder(move |cmd| {
            let channel = cmd.chars().last().unwrap_or('1');
            let reply = if cmd == "id" || cmd.ends_with("$id") {
                "electronctrl_20231112_3".to_string()
            } else if let Some(rest) = cmd.strip_prefix("psusetv") {
                let mut chars = rest.chars();
                let ch = chars.next().unwrap_or('1');
                voltages.insert(ch, chars.as_str().parse().unwrap_or(0));
                return Vec::new();
            } else if cmd.starts_with("psugetv") {
                format!("v{}:{}", channel, voltages.get(&channel).copied().unwrap_or(0))
            } else if cmd.starts_with("psugeta") {
                format!("a{}:0000", channel)
            } else if cmd == "psumode" {
                "psustateVVV-".to_string()
            } else if cmd == "fila" {
                "af:0".to_string()
            } else if cmd == "filon" {
                "filseta:0".to_string()
            } else if cmd == "filoff" {
                "filseta:disabled".to_string()
            } else if let Some(rest) = cmd.strip_prefix("setfila") {
                format!("filseta:{}", rest)
            } else if cmd == "insul" {
                "insulok".to_string()
            } else if cmd == "beamon" {
                "beamon".to_string()
            } else if cmd == "off" {
                voltages.clear();
                "off".to_string()
            } else {
                return Vec::new();
            };
            vec![reply]
        })
    }

    /// Replace the responder
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
    }

    /// Queue raw bytes for the reader
    pub fn inject(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        state.rx.extend(bytes.iter().copied());
        self.data_ready.notify_all();
    }

    /// Queue one framed reply payload (e.g. `"v2:1800"`)
    pub fn inject_reply(&self, payload: &str) {
        self.inject(format!("$$${}\n", payload).as_bytes());
    }

    /// Every write so far, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.clone()
    }

    /// Every write so far as text
    pub fn written_commands(&self) -> Vec<String> {
        self.state
            .lock()
            .writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    /// Forget the write log
    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// Make later writes fail with a serial error
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Simulate the cable being pulled: the reader sees `Closed`
    pub fn disconnect(&self) {
        self.state.lock().closed = true;
        self.data_ready.notify_all();
    }

    /// True once closed or disconnected
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn command_text(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    let text = text.trim_end_matches('\n');
    text.strip_prefix("$$$").unwrap_or(text).to_string()
}

impl Transport for SimulatedTransport {
    fn read_byte(&self) -> ReadOutcome {
        let mut state = self.state.lock();
        if state.rx.is_empty() && !state.closed {
            self.data_ready.wait_for(&mut state, self.poll);
        }
        match state.rx.pop_front() {
            Some(b) => ReadOutcome::Byte(b),
            None if state.closed => ReadOutcome::Closed,
            None => ReadOutcome::Idle,
        }
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ConnectionError::ConnectionLost {
                reason: format!("{} is closed", self.name),
            }
            .into());
        }
        if state.fail_writes {
            return Err(ConnectionError::SerialError {
                reason: "simulated write failure".to_string(),
            }
            .into());
        }
        state.writes.push(data.to_vec());

        let command = command_text(data);
        let replies = match state.responder.as_mut() {
            Some(responder) => responder(&command),
            None => Vec::new(),
        };
        for reply in replies {
            state.rx.extend(format!("$$${}\n", reply).bytes());
        }
        self.data_ready.notify_all();
        Ok(())
    }

    fn close(&self) {
        self.disconnect();
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(t: &SimulatedTransport) -> Vec<u8> {
        let mut out = Vec::new();
        while let ReadOutcome::Byte(b) = t.read_byte() {
            out.push(b);
        }
        out
    }

    #[test]
    fn test_writes_are_logged() {
        let t = SimulatedTransport::new();
        t.write_all(b"$$$id\n").unwrap();
        assert_eq!(t.written_commands(), vec!["$$$id\n".to_string()]);
        assert_eq!(t.read_byte(), ReadOutcome::Idle);
    }

    #[test]
    fn test_responder_replies_are_framed() {
        let t = SimulatedTransport::with_responder(|cmd| vec![format!("echo:{}", cmd)]);
        t.write_all(b"$$$psugetv2\n").unwrap();
        assert_eq!(drain(&t), b"$$$echo:psugetv2\n".to_vec());
    }

    #[test]
    fn test_controller_remembers_voltage() {
        let t = SimulatedTransport::controller();
        t.write_all(b"$$$psusetv21800\n").unwrap();
        t.write_all(b"$$$psugetv2\n").unwrap();
        assert_eq!(drain(&t), b"$$$v2:1800\n".to_vec());
    }

    #[test]
    fn test_disconnect_closes_reads_and_writes() {
        let t = SimulatedTransport::new();
        t.inject(b"x");
        t.disconnect();
        assert_eq!(t.read_byte(), ReadOutcome::Byte(b'x'));
        assert_eq!(t.read_byte(), ReadOutcome::Closed);
        assert!(t.write_all(b"$$$id\n").is_err());
    }
}
