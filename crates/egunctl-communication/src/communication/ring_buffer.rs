//! Fixed-capacity circular receive buffer
//!
//! Bytes read from the transport are staged here until the frame decoder
//! has seen a complete frame. Every accessor takes the internal lock for
//! the duration of that single operation only.
//!
//! One slot is reserved to tell a full buffer from an empty one: a buffer
//! of capacity `N` holds at most `N - 1` bytes.

use egunctl_core::DeviceError;
use parking_lot::Mutex;

/// Default capacity of the receive buffer
pub const DEFAULT_CAPACITY: usize = 512;

/// What `push` does when the data does not fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Store nothing and report [`PushOutcome::Dropped`]
    #[default]
    Discard,
    /// Store nothing and fail with [`DeviceError::BufferOverflow`]
    Reject,
    /// Evict the oldest unread bytes to make room
    DropOldest,
}

/// Result of a successful `push`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// All bytes were stored; `evicted` old bytes were discarded to make room
    Stored { evicted: usize },
    /// Nothing was stored because the batch did not fit
    Dropped,
}

struct Inner {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl Inner {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn available(&self) -> usize {
        let n = self.capacity();
        (self.head + n - self.tail) % n
    }

    fn remaining(&self) -> usize {
        self.capacity() - self.available() - 1
    }

    fn advance_tail(&mut self, count: usize) {
        let count = count.min(self.available());
        self.tail = (self.tail + count) % self.capacity();
    }
}

/// Thread-safe ring buffer of bytes
pub struct RingBuffer {
    inner: Mutex<Inner>,
    policy: OverflowPolicy,
}

impl RingBuffer {
    /// Create a buffer with the given capacity and the default policy.
    ///
    /// Capacities below 2 are raised to 2 (one usable byte).
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, OverflowPolicy::default())
    }

    /// Create a buffer with an explicit overflow policy
    pub fn with_policy(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(2);
        Self {
            inner: Mutex::new(Inner {
                data: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                tail: 0,
            }),
            policy,
        }
    }

    /// Overflow policy of this buffer
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Total number of slots (one more than the usable space)
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    /// Number of unread bytes
    pub fn available(&self) -> usize {
        self.inner.lock().available()
    }

    /// True if there is nothing to read
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.head == inner.tail
    }

    /// Free space before the buffer is full
    pub fn remaining_capacity(&self) -> usize {
        self.inner.lock().remaining()
    }

    /// Append a batch of bytes, all or nothing.
    ///
    /// When the batch does not fit the configured [`OverflowPolicy`]
    /// decides what happens. A batch larger than the usable capacity can
    /// never be stored and is treated as not fitting under every policy.
    pub fn push(&self, bytes: &[u8]) -> Result<PushOutcome, DeviceError> {
        let mut inner = self.inner.lock();
        let remaining = inner.remaining();
        let mut evicted = 0;

        if bytes.len() > remaining {
            let usable = inner.capacity() - 1;
            match self.policy {
                OverflowPolicy::DropOldest if bytes.len() <= usable => {
                    evicted = bytes.len() - remaining;
                    inner.advance_tail(evicted);
                }
                OverflowPolicy::Reject => {
                    return Err(DeviceError::BufferOverflow {
                        requested: bytes.len(),
                        available: remaining,
                    });
                }
                _ => return Ok(PushOutcome::Dropped),
            }
        }

        let n = inner.capacity();
        for &b in bytes {
            let head = inner.head;
            inner.data[head] = b;
            inner.head = (head + 1) % n;
        }
        Ok(PushOutcome::Stored { evicted })
    }

    /// Append a single byte
    pub fn push_byte(&self, byte: u8) -> Result<PushOutcome, DeviceError> {
        self.push(&[byte])
    }

    /// Remove and return the oldest byte
    pub fn pop(&self) -> Option<u8> {
        let mut inner = self.inner.lock();
        if inner.head == inner.tail {
            return None;
        }
        let b = inner.data[inner.tail];
        inner.advance_tail(1);
        Some(b)
    }

    /// Look at the byte `distance` positions after the oldest one
    pub fn peek(&self, distance: usize) -> Option<u8> {
        let inner = self.inner.lock();
        if distance >= inner.available() {
            return None;
        }
        Some(inner.data[(inner.tail + distance) % inner.capacity()])
    }

    /// Drop up to `count` of the oldest bytes
    pub fn discard(&self, count: usize) {
        self.inner.lock().advance_tail(count);
    }

    /// Remove exactly `count` bytes, or nothing if fewer are available
    pub fn read(&self, count: usize) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        if inner.available() < count {
            return None;
        }
        let n = inner.capacity();
        let out = (0..count)
            .map(|i| inner.data[(inner.tail + i) % n])
            .collect();
        inner.advance_tail(count);
        Some(out)
    }

    /// Forget all unread bytes
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.tail = inner.head;
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
