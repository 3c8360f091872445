//! Frame struct and encoder.
//!
//! A [`Frame`] is what the parser hands out: command, un-escaped payload and
//! the checksum byte exactly as transmitted. Uses `bytes::Bytes` for the
//! payload so frames can be passed between tasks without copying.
//!
//! # Example
//!
//! ```
//! use comfoair_bridge::protocol::{build_frame, Frame};
//!
//! let bytes = build_frame(0x0099, &[0x01]).unwrap();
//! assert_eq!(bytes, [0x07, 0xF0, 0x00, 0x99, 0x01, 0x01, 0x48, 0x07, 0x0F]);
//!
//! let frame = Frame::from_parts(0x0099, &[0x01], 0x48);
//! assert!(frame.is_valid());
//! ```

use bytes::Bytes;

use super::wire_format::{checksum, END, MAX_PAYLOAD_SIZE, PREFIX_SIZE, START, TRAILER_SIZE};
use crate::error::{BridgeError, Result};

/// A structurally complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command code (message type).
    pub command: u16,
    /// Un-escaped payload bytes.
    pub payload: Bytes,
    /// Checksum byte as received.
    pub checksum: u8,
}

impl Frame {
    /// Create a new frame.
    pub fn new(command: u16, payload: Bytes, checksum: u8) -> Self {
        Self {
            command,
            payload,
            checksum,
        }
    }

    /// Create a frame from raw parts (copies payload).
    pub fn from_parts(command: u16, payload: &[u8], checksum: u8) -> Self {
        Self {
            command,
            payload: Bytes::copy_from_slice(payload),
            checksum,
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length as carried in the length byte.
    #[inline]
    pub fn length(&self) -> u8 {
        self.payload.len() as u8
    }

    /// Checksum recomputed from command, length and payload.
    #[inline]
    pub fn expected_checksum(&self) -> u8 {
        checksum(self.command, self.length(), &self.payload)
    }

    /// Check the transmitted checksum against the recomputed one.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.checksum == self.expected_checksum()
    }
}

/// Build a complete frame as a single byte vector.
///
/// Payload bytes are written verbatim. A payload byte of 0x07 is *not*
/// doubled on the way out; the device accepts the control frames this bridge
/// sends, none of which contain 0x07.
///
/// # Errors
///
/// Returns a protocol error if the payload does not fit the length byte.
pub fn build_frame(command: u16, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(BridgeError::Protocol(format!(
            "Payload size {} exceeds maximum {}",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let length = payload.len() as u8;
    let mut buf = Vec::with_capacity(PREFIX_SIZE + payload.len() + TRAILER_SIZE);
    buf.extend_from_slice(&START);
    buf.extend_from_slice(&command.to_be_bytes());
    buf.push(length);
    buf.extend_from_slice(payload);
    buf.push(checksum(command, length, payload));
    buf.extend_from_slice(&END);
    Ok(buf)
}
