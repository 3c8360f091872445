//! Wire format constants and checksum.
//!
//! Every frame on the RS232 link has the layout:
//! ```text
//! ┌────────┬─────────┬────────┬──────────────────┬──────────┬────────┐
//! │ START  │ Command │ Length │ Payload          │ Checksum │ END    │
//! │ 07 F0  │ 2 bytes │ 1 byte │ Length bytes,    │ 1 byte   │ 07 0F  │
//! │        │ u16 BE  │        │ 0x07 doubled     │          │        │
//! └────────┴─────────┴────────┴──────────────────┴──────────┴────────┘
//! ```
//!
//! `Length` counts payload bytes after un-escaping, not wire bytes.

use std::fmt::Write;

/// Start-of-frame marker.
pub const START: [u8; 2] = [0x07, 0xF0];

/// End-of-frame marker.
pub const END: [u8; 2] = [0x07, 0x0F];

/// Escape byte. A literal 0x07 inside a payload is sent as `07 07`.
pub const ESCAPE: u8 = 0x07;

/// Constant added to every checksum before truncation.
pub const CHECKSUM_OFFSET: u32 = 173;

/// Bytes before the payload: START(2) + COMMAND(2) + LENGTH(1).
pub const PREFIX_SIZE: usize = 5;

/// Bytes after the payload: CHECKSUM(1) + END(2).
pub const TRAILER_SIZE: usize = 3;

/// Largest payload the single length byte can describe.
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize;

/// Command codes understood by the bridge.
pub mod commands {
    /// Set fan level (1-byte payload, 1..=4).
    pub const SET_FAN_LEVEL: u16 = 0x0099;
    /// Set comfort temperature (1-byte payload, raw = celsius * 2 + 40).
    pub const SET_TEMPERATURE: u16 = 0x00D3;
    /// Set RS232/PC mode (1-byte payload).
    pub const SET_PC_MODE: u16 = 0x009B;
    /// Emulated display button press/release (7-byte payload).
    pub const BUTTON: u16 = 0x0037;

    /// Display/LED status, carries the airflow direction flags.
    pub const DISPLAY_STATUS: u16 = 0x003C;
    /// RS232 mode status.
    pub const RS232_STATUS: u16 = 0x009C;
    /// Ventilation status (fan percentages and level).
    pub const VENTILATION_STATUS: u16 = 0x00CE;
    /// Temperature status.
    pub const TEMPERATURE_STATUS: u16 = 0x00D2;
    /// Bypass status.
    pub const BYPASS_STATUS: u16 = 0x00E0;
    /// Preheater and frost protection status.
    pub const PREHEATER_STATUS: u16 = 0x00E2;

    /// Airflow button "press" payload.
    pub const AIRFLOW_BUTTON_PRESS: [u8; 7] = [0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0x02];
    /// Airflow button "release" payload.
    pub const AIRFLOW_BUTTON_RELEASE: [u8; 7] = [0x00, 0x0C, 0x00, 0x00, 0x00, 0x00, 0x03];
}

/// Compute the frame checksum over command, length and un-escaped payload.
///
/// Payload bytes equal to 0x07 only count on alternating occurrences within
/// a consecutive run: the first is summed, the next skipped, and so on. Any
/// other byte resets the run.
///
/// # Example
///
/// ```
/// use comfoair_bridge::protocol::checksum;
///
/// // Fan level 1 request: 07 F0 00 99 01 01 48 07 0F
/// assert_eq!(checksum(0x0099, 1, &[0x01]), 0x48);
/// ```
pub fn checksum(command: u16, length: u8, payload: &[u8]) -> u8 {
    let [hi, lo] = command.to_be_bytes();
    let mut sum = hi as u32 + lo as u32 + length as u32;
    let mut skip_next_escape = false;

    for &b in payload {
        if b == ESCAPE {
            if skip_next_escape {
                skip_next_escape = false;
                continue;
            }
            skip_next_escape = true;
        } else {
            skip_next_escape = false;
        }
        sum += b as u32;
    }

    ((sum + CHECKSUM_OFFSET) & 0xFF) as u8
}

/// Outcome of un-escaping a payload from its wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unescaped {
    /// All payload bytes, plus the number of wire bytes they took.
    Complete { payload: Vec<u8>, consumed: usize },
    /// The wire bytes end before the payload does.
    Incomplete,
    /// A 0x07 followed by anything other than 0x07.
    InvalidEscape,
}

/// Decode `length` payload bytes from escaped wire bytes (`07 07` -> `07`).
///
/// `wire` starts right after the length byte and may run past the payload.
///
/// ```
/// use comfoair_bridge::protocol::{unescape_payload, Unescaped};
///
/// let decoded = unescape_payload(&[0x01, 0x07, 0x07, 0x02, 0x55], 3);
/// assert_eq!(
///     decoded,
///     Unescaped::Complete { payload: vec![0x01, 0x07, 0x02], consumed: 4 }
/// );
/// ```
pub fn unescape_payload(wire: &[u8], length: usize) -> Unescaped {
    let mut payload = Vec::with_capacity(length);
    let mut pos = 0;

    while payload.len() < length {
        let Some(&b) = wire.get(pos) else {
            return Unescaped::Incomplete;
        };

        if b != ESCAPE {
            payload.push(b);
            pos += 1;
            continue;
        }

        match wire.get(pos + 1) {
            None => return Unescaped::Incomplete,
            Some(&ESCAPE) => {
                payload.push(ESCAPE);
                pos += 2;
            }
            Some(_) => return Unescaped::InvalidEscape,
        }
    }

    Unescaped::Complete {
        payload,
        consumed: pos,
    }
}

/// Format bytes as space-separated lowercase hex pairs for logging.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02x}", b);
    }
    out
}
