//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the RS232 protocol spoken by the ventilation unit:
//! - Frame markers, command codes and the escape-aware checksum
//! - Frame encoder for outbound control frames
//! - Resynchronizing frame buffer for the inbound byte stream

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::{FrameBuffer, ParserStats};
pub use wire_format::{
    checksum, commands, hex_dump, unescape_payload, Unescaped, CHECKSUM_OFFSET, END, ESCAPE,
    MAX_PAYLOAD_SIZE, PREFIX_SIZE, START, TRAILER_SIZE,
};
