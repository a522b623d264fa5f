//! Command queue between the bus and the device
//!
//! Bus callbacks only ever push here; the supervising loop is the single
//! writer of device commands and pops in FIFO order. The lock is held for
//! queue mutation only.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Default number of queued requests before the oldest is dropped
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Device command requested over the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuedCommand {
    Identify,
    GetVoltage(u8),
    GetCurrent(u8),
}

impl fmt::Display for QueuedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identify => write!(f, "id"),
            Self::GetVoltage(ch) => write!(f, "getv {}", ch),
            Self::GetCurrent(ch) => write!(f, "geta {}", ch),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<QueuedCommand>,
    /// Set by every push, cleared by `wait_for_activity`
    activity: bool,
}

/// Bounded FIFO of pending device commands
#[derive(Debug)]
pub struct CommandQueue {
    state: Mutex<QueueState>,
    wakeup: Condvar,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            wakeup: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a command. When the queue is full the oldest entry is
    /// dropped and returned.
    pub fn push(&self, command: QueuedCommand) -> Option<QueuedCommand> {
        let evicted = {
            let mut state = self.state.lock();
            let evicted = if state.items.len() >= self.capacity {
                state.items.pop_front()
            } else {
                None
            };
            state.items.push_back(command);
            state.activity = true;
            evicted
        };
        self.wakeup.notify_all();
        evicted
    }

    /// Put a command back at the head, e.g. after the link failed while
    /// executing it
    pub fn requeue_front(&self, command: QueuedCommand) {
        let mut state = self.state.lock();
        if state.items.len() >= self.capacity {
            state.items.pop_back();
        }
        state.items.push_front(command);
    }

    pub fn pop(&self) -> Option<QueuedCommand> {
        self.state.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Snapshot of the queued commands, head first
    pub fn pending(&self) -> Vec<QueuedCommand> {
        self.state.lock().items.iter().copied().collect()
    }

    pub fn clear(&self) {
        self.state.lock().items.clear();
    }

    /// Wait until something was pushed since the last call, or until
    /// `timeout` passes. Returns true if there was activity.
    pub fn wait_for_activity(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.activity {
            if self.wakeup.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        std::mem::take(&mut state.activity)
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = CommandQueue::default();
        queue.push(QueuedCommand::GetVoltage(1));
        queue.push(QueuedCommand::GetCurrent(2));
        queue.push(QueuedCommand::Identify);

        assert_eq!(queue.pop(), Some(QueuedCommand::GetVoltage(1)));
        assert_eq!(queue.pop(), Some(QueuedCommand::GetCurrent(2)));
        assert_eq!(queue.pop(), Some(QueuedCommand::Identify));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let queue = CommandQueue::new(2);
        assert_eq!(queue.push(QueuedCommand::GetVoltage(1)), None);
        assert_eq!(queue.push(QueuedCommand::GetVoltage(2)), None);
        assert_eq!(
            queue.push(QueuedCommand::GetVoltage(3)),
            Some(QueuedCommand::GetVoltage(1))
        );
        assert_eq!(
            queue.pending(),
            vec![QueuedCommand::GetVoltage(2), QueuedCommand::GetVoltage(3)]
        );
    }

    #[test]
    fn test_requeue_front() {
        let queue = CommandQueue::default();
        queue.push(QueuedCommand::GetCurrent(3));
        queue.requeue_front(QueuedCommand::GetVoltage(1));
        assert_eq!(queue.pop(), Some(QueuedCommand::GetVoltage(1)));
        assert_eq!(queue.pop(), Some(QueuedCommand::GetCurrent(3)));
    }

    #[test]
    fn test_activity_wakes_waiter() {
        let queue = Arc::new(CommandQueue::default());
        assert!(!queue.wait_for_activity(Duration::from_millis(10)));

        let q = queue.clone();
        let pusher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            q.push(QueuedCommand::Identify);
        });
        assert!(queue.wait_for_activity(Duration::from_secs(5)));
        pusher.join().unwrap();

        // Flag is consumed
        assert!(!queue.wait_for_activity(Duration::from_millis(10)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_display() {
        assert_eq!(QueuedCommand::GetVoltage(2).to_string(), "getv 2");
        assert_eq!(QueuedCommand::Identify.to_string(), "id");
    }
}
