//! Frame decoder for the controller's reply stream
//!
//! Replies arrive as `$$$<payload>\n`. Bytes are staged in a
//! [`RingBuffer`] one at a time; after every byte the decoder
//! resynchronises on the three byte marker, looks for the line feed and
//! hands out the payload between marker and terminator.
//!
//! Noise before a marker is discarded. A frame that never got its
//! terminator is dropped as soon as the next marker byte shows up.

use crate::communication::ring_buffer::{PushOutcome, RingBuffer};

/// Marker byte
pub const SYNC_BYTE: u8 = b'$';

/// Start-of-frame marker
pub const SYNC_MARKER: &[u8; 3] = b"$$$";

/// End-of-frame byte
pub const TERMINATOR: u8 = b'\n';

const MARKER_LEN: usize = SYNC_MARKER.len();

/// Smallest buffered frame: marker plus one payload byte
const MIN_FRAME: usize = MARKER_LEN + 1;

/// Incremental decoder over an owned receive buffer
pub struct FrameDecoder {
    buffer: RingBuffer,
    dropped_bytes: u64,
}

impl FrameDecoder {
    /// Create a decoder staging bytes in the given buffer
    pub fn new(buffer: RingBuffer) -> Self {
        Self {
            buffer,
            dropped_bytes: 0,
        }
    }

    /// Receive buffer
    pub fn buffer(&self) -> &RingBuffer {
        &self.buffer
    }

    /// Bytes that were lost because the buffer was full
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    /// Push one received byte. Returns the payload of the frame it
    /// completed, if any.
    pub fn push_byte(&mut self, byte: u8) -> Option<Vec<u8>> {
        match self.buffer.push_byte(byte) {
            Ok(PushOutcome::Stored { evicted: 0 }) => {}
            Ok(PushOutcome::Stored { evicted }) => {
                tracing::warn!("Receive buffer full, evicted {} bytes", evicted);
            }
            Ok(PushOutcome::Dropped) => {
                self.dropped_bytes += 1;
                tracing::warn!("Receive buffer full, byte dropped");
            }
            Err(e) => {
                self.dropped_bytes += 1;
                tracing::warn!("Receive buffer refused byte: {}", e);
            }
        }
        self.next_frame()
    }

    /// Push a batch of bytes, returning every completed payload in order
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes.iter().filter_map(|&b| self.push_byte(b)).collect()
    }

    fn synced(&self) -> bool {
        (0..MARKER_LEN).all(|i| self.buffer.peek(i) == Some(SYNC_BYTE))
    }

    fn next_frame(&mut self) -> Option<Vec<u8>> {
        'rescan: loop {
            while self.buffer.available() >= MIN_FRAME && !self.synced() {
                self.buffer.discard(1);
            }
            let available = self.buffer.available();
            if available < MIN_FRAME {
                return None;
            }

            for i in MARKER_LEN..available {
                match self.buffer.peek(i) {
                    Some(TERMINATOR) => {
                        let frame = self.buffer.read(i)?;
                        self.buffer.discard(1);
                        if frame.len() < MIN_FRAME {
                            tracing::trace!("Empty frame skipped");
                            continue 'rescan;
                        }
                        return Some(frame[MARKER_LEN..].to_vec());
                    }
                    Some(SYNC_BYTE) => {
                        tracing::debug!("Unterminated frame of {} bytes discarded", i);
                        self.buffer.discard(i);
                        continue 'rescan;
                    }
                    _ => {}
                }
            }

            // A full buffer without terminator can never complete a frame
            if self.buffer.remaining_capacity() == 0 {
                tracing::warn!("Receive buffer full without frame terminator, clearing");
                self.buffer.clear();
            }
            return None;
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(RingBuffer::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_noise_is_skipped() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.feed(b"xx$$$hello\n");
        assert_eq!(frames, vec![b"hello".to_vec()]);
        assert!(decoder.buffer().is_empty());

        let frames = decoder.feed(b"$$$off\n");
        assert_eq!(frames, vec![b"off".to_vec()]);
    }

    #[test]
    fn test_unterminated_frame_is_dropped() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.feed(b"$$$ab$$$cdef\n");
        assert_eq!(frames, vec![b"cdef".to_vec()]);
    }

    #[test]
    fn test_empty_frame_not_dispatched() {
        let mut decoder = FrameDecoder::default();
        assert!(decoder.feed(b"$$$\n").is_empty());
        assert_eq!(decoder.feed(b"$$$v1:5\n"), vec![b"v1:5".to_vec()]);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.feed(b"$$$v1:100\n$$$v2:200\nnoise$$$a3:0150\n");
        assert_eq!(
            frames,
            vec![b"v1:100".to_vec(), b"v2:200".to_vec(), b"a3:0150".to_vec()]
        );
    }

    #[test]
    fn test_frame_split_across_feeds() {
        let mut decoder = FrameDecoder::default();
        assert!(decoder.feed(b"$$$psus").is_empty());
        assert_eq!(decoder.feed(b"tateVVC-\n"), vec![b"psustateVVC-".to_vec()]);
    }

    #[test]
    fn test_full_buffer_recovers() {
        let mut decoder = FrameDecoder::new(RingBuffer::new(16));
        let mut noise = b"$$$".to_vec();
        noise.extend(std::iter::repeat(b'x').take(40));
        assert!(decoder.feed(&noise).is_empty());
        assert_eq!(decoder.feed(b"$$$off\n"), vec![b"off".to_vec()]);
    }
}
