//! Resynchronizing frame buffer for the inbound byte stream.
//!
//! Uses `bytes::BytesMut` to accumulate socket reads. Each push re-scans the
//! buffer from the front:
//! - find `START`, discard everything before it
//! - un-escape the payload (`07 07` -> `07`) until `length` bytes are produced
//! - expect checksum + `END` right after the payload
//!
//! Broken escapes and a missing `END` cost exactly one byte: the front byte is
//! dropped and the scan starts over. Checksum mismatches drop the whole frame
//! without resync because its boundaries were sound.
//!
//! # Example
//!
//! ```
//! use comfoair_bridge::protocol::{build_frame, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = build_frame(0x009C, &[0x02]).unwrap();
//!
//! // Data arrives in chunks from the socket
//! assert!(buffer.push(&bytes[..4]).is_empty());
//! let frames = buffer.push(&bytes[4..]);
//!
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].command, 0x009C);
//! ```

use std::collections::BTreeSet;

use bytes::{Buf, Bytes, BytesMut};

use super::wire_format::{hex_dump, unescape_payload, Unescaped, END, PREFIX_SIZE, START};
use super::Frame;

/// Default buffer capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// Counters describing what the parser has seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserStats {
    /// Frames with a matching checksum.
    pub frames: u64,
    /// Structurally complete frames dropped for a checksum mismatch.
    pub checksum_errors: u64,
    /// Single-byte drops after a broken escape or a missing end marker.
    pub resyncs: u64,
    /// Bytes thrown away while hunting for a start marker.
    pub discarded: u64,
}

/// Outcome of one scan over the buffered bytes.
enum Scan {
    /// A structurally complete frame was removed from the buffer.
    Frame(Frame),
    /// Not enough bytes yet.
    Incomplete,
}

/// Buffer for accumulating incoming bytes and extracting validated frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Command codes of every structurally complete frame, valid or not.
    seen_commands: BTreeSet<u16>,
    /// Running counters.
    stats: ParserStats,
}

impl FrameBuffer {
    /// Create a new frame buffer.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new frame buffer with a custom initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            seen_commands: BTreeSet::new(),
            stats: ParserStats::default(),
        }
    }

    /// Push data into the buffer and extract all complete, valid frames.
    ///
    /// Partial frames stay buffered for the next push. Noise, broken frames
    /// and checksum failures are absorbed here and never surface.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();

        while let Scan::Frame(frame) = self.scan() {
            self.seen_commands.insert(frame.command);

            if frame.is_valid() {
                self.stats.frames += 1;
                frames.push(frame);
            } else {
                self.stats.checksum_errors += 1;
                tracing::warn!(
                    "Checksum error on command {:04x}: got {:02x}, expected {:02x}, data={}",
                    frame.command,
                    frame.checksum,
                    frame.expected_checksum(),
                    hex_dump(&frame.payload)
                );
            }
        }

        frames
    }

    /// Scan for the next structurally complete frame.
    ///
    /// Restarts from the top after every resync, so a single call may drop
    /// several bytes before it finds a frame or runs out of data.
    fn scan(&mut self) -> Scan {
        loop {
            match find_start(&self.buffer) {
                Some(0) => {}
                Some(pos) => {
                    self.stats.discarded += pos as u64;
                    self.buffer.advance(pos);
                }
                None => {
                    // Keep a trailing 0x07: it may be the first half of START
                    let keep = usize::from(self.buffer.last() == Some(&START[0]));
                    let drop = self.buffer.len() - keep;
                    self.stats.discarded += drop as u64;
                    self.buffer.advance(drop);
                    return Scan::Incomplete;
                }
            }

            if self.buffer.len() < PREFIX_SIZE {
                return Scan::Incomplete;
            }

            let command = u16::from_be_bytes([self.buffer[2], self.buffer[3]]);
            let length = self.buffer[4] as usize;

            let (payload, consumed) =
                match unescape_payload(&self.buffer[PREFIX_SIZE..], length) {
                    Unescaped::Complete { payload, consumed } => (payload, consumed),
                    Unescaped::Incomplete => return Scan::Incomplete,
                    Unescaped::InvalidEscape => {
                        tracing::debug!("Invalid escape sequence, resync");
                        self.resync();
                        continue;
                    }
                };
            let pos = PREFIX_SIZE + consumed;

            if self.buffer.len() < pos + 3 {
                return Scan::Incomplete;
            }

            let checksum = self.buffer[pos];
            if self.buffer[pos + 1..pos + 3] != END {
                tracing::debug!("Frame sync lost, dropping 1 byte");
                self.resync();
                continue;
            }

            self.buffer.advance(pos + 3);
            return Scan::Frame(Frame::new(command, Bytes::from(payload), checksum));
        }
    }

    /// Drop the front byte so the next scan looks for a later start marker.
    fn resync(&mut self) {
        self.stats.resyncs += 1;
        self.buffer.advance(1);
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear buffered bytes. Counters and seen commands are kept.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Command codes seen so far, sorted.
    pub fn seen_commands(&self) -> &BTreeSet<u16> {
        &self.seen_commands
    }

    /// Parser counters.
    pub fn stats(&self) -> ParserStats {
        self.stats
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of the first start marker.
fn find_start(buf: &[u8]) -> Option<usize> {
    buf.windows(START.len()).position(|w| w == START)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, checksum, commands, ESCAPE};

    /// Build a wire frame with the payload escaped the way the device sends it.
    fn device_frame(command: u16, payload: &[u8]) -> Vec<u8> {
        let mut bytes = START.to_vec();
        bytes.extend_from_slice(&command.to_be_bytes());
        bytes.push(payload.len() as u8);
        for &b in payload {
            bytes.push(b);
            if b == ESCAPE {
                bytes.push(ESCAPE);
            }
        }
        bytes.push(checksum(command, payload.len() as u8, payload));
        bytes.extend_from_slice(&END);
        bytes
    }

    fn ventilation_payload(level: u8) -> Vec<u8> {
        let mut payload = vec![0u8; 14];
        payload[6] = 35;
        payload[7] = 40;
        payload[8] = level;
        payload
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let bytes = build_frame(commands::RS232_STATUS, &[0x02]).unwrap();

        let frames = buffer.push(&bytes);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, commands::RS232_STATUS);
        assert_eq!(frames[0].payload(), &[0x02]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_round_trip_without_escape_bytes() {
        let payload = [0x10, 0x20, 0x30, 0xF0, 0x0F, 0x00];
        let bytes = build_frame(0x00D2, &payload).unwrap();

        let frames = FrameBuffer::new().push(&bytes);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, 0x00D2);
        assert_eq!(frames[0].payload(), &payload);
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut combined = Vec::new();
        combined.extend(build_frame(commands::RS232_STATUS, &[0x01]).unwrap());
        combined.extend(build_frame(commands::BYPASS_STATUS, &[0u8; 7]).unwrap());
        combined.extend(device_frame(commands::VENTILATION_STATUS, &ventilation_payload(2)));

        let frames = buffer.push(&combined);

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].command, commands::RS232_STATUS);
        assert_eq!(frames[1].command, commands::BYPASS_STATUS);
        assert_eq!(frames[2].command, commands::VENTILATION_STATUS);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_escaped_payload_is_unescaped() {
        let payload = [0x01, 0x07, 0x02, 0x07, 0x07, 0x03];
        let bytes = device_frame(0x00E2, &payload);
        // Three escaped 0x07 bytes add three wire bytes
        assert_eq!(bytes.len(), 5 + payload.len() + 3 + 3);

        let frames = FrameBuffer::new().push(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &payload);
        assert_eq!(frames[0].length(), payload.len() as u8);
    }

    #[test]
    fn test_every_split_point_yields_one_frame() {
        let payload = [0x11, 0x07, 0x22, 0x07, 0x07, 0x33, 0x44];
        let bytes = device_frame(0x003C, &payload);
        let whole = FrameBuffer::new().push(&bytes);
        assert_eq!(whole.len(), 1);

        // Covers splits inside START, the escaped payload and END
        for split in 1..bytes.len() {
            let mut buffer = FrameBuffer::new();
            let mut frames = buffer.push(&bytes[..split]);
            frames.extend(buffer.push(&bytes[split..]));

            assert_eq!(frames, whole, "split at {}", split);
            assert!(buffer.is_empty(), "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let bytes = device_frame(commands::VENTILATION_STATUS, &ventilation_payload(3));
        let mut buffer = FrameBuffer::new();
        let mut all_frames = Vec::new();

        for byte in &bytes {
            all_frames.extend(buffer.push(&[*byte]));
        }

        assert_eq!(all_frames.len(), 1);
        assert_eq!(all_frames[0].payload()[8], 3);
    }

    #[test]
    fn test_garbage_before_frame() {
        let mut data = vec![0x00, 0xFF, 0x07, 0x42, 0x0F, 0x07, 0x07, 0x99];
        data.extend(build_frame(commands::RS232_STATUS, &[0x03]).unwrap());

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&data);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &[0x03]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().frames, 1);
    }

    #[test]
    fn test_noise_without_start_is_discarded() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&[0x01, 0x02, 0x03, 0xF0, 0x0F]);

        assert!(frames.is_empty());
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().discarded, 5);
    }

    #[test]
    fn test_trailing_escape_byte_is_kept() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&[0x55, 0x66, 0x07]);
        assert_eq!(buffer.len(), 1);

        let bytes = build_frame(commands::RS232_STATUS, &[0x01]).unwrap();
        let frames = buffer.push(&bytes[1..]);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_invalid_escape_resyncs() {
        // Payload claims 2 bytes but carries 07 55, a broken escape
        let mut data = vec![0x07, 0xF0, 0x00, 0x3C, 0x02, 0x07, 0x55, 0x00, 0x07, 0x0F];
        data.extend(build_frame(commands::RS232_STATUS, &[0x04]).unwrap());

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&data);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, commands::RS232_STATUS);
        assert_eq!(frames[0].payload(), &[0x04]);
        assert!(buffer.stats().resyncs >= 1);
    }

    #[test]
    fn test_missing_end_marker_resyncs() {
        let mut broken = build_frame(commands::BYPASS_STATUS, &[0u8; 7]).unwrap();
        let n = broken.len();
        broken[n - 1] = 0x00; // END becomes 07 00

        let mut data = broken;
        data.extend(build_frame(commands::RS232_STATUS, &[0x01]).unwrap());

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&data);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, commands::RS232_STATUS);
        assert_eq!(buffer.stats().resyncs, 1);
    }

    #[test]
    fn test_checksum_error_drops_frame_only() {
        let mut corrupt = build_frame(commands::RS232_STATUS, &[0x01]).unwrap();
        corrupt[6] ^= 0xFF;

        let mut data = corrupt;
        data.extend(build_frame(commands::RS232_STATUS, &[0x03]).unwrap());

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&data);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &[0x03]);
        let stats = buffer.stats();
        assert_eq!(stats.checksum_errors, 1);
        assert_eq!(stats.resyncs, 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_seen_commands_include_invalid_frames() {
        let mut corrupt = build_frame(0x00AA, &[]).unwrap();
        corrupt[5] = corrupt[5].wrapping_add(1);

        let mut data = corrupt;
        data.extend(build_frame(commands::RS232_STATUS, &[0x01]).unwrap());

        let mut buffer = FrameBuffer::new();
        buffer.push(&data);

        let seen: Vec<u16> = buffer.seen_commands().iter().copied().collect();
        assert_eq!(seen, vec![commands::RS232_STATUS, 0x00AA]);
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let frame1 = build_frame(commands::RS232_STATUS, &[0x01]).unwrap();
        let frame2 = build_frame(commands::RS232_STATUS, &[0x02]).unwrap();

        let mut data = frame1.clone();
        data.extend_from_slice(&frame2[..5]);

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&data);
        assert_eq!(frames.len(), 1);
        assert_eq!(buffer.len(), 5);

        let frames = buffer.push(&frame2[5..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &[0x02]);
    }

    #[test]
    fn test_clear_keeps_counters() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&build_frame(commands::RS232_STATUS, &[0x01]).unwrap());
        buffer.push(&START);
        assert_eq!(buffer.len(), 2);

        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().frames, 1);
        assert_eq!(buffer.seen_commands().len(), 1);
    }
}
