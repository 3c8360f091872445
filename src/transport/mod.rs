//! Transport module - TCP link to the RS232 gateway.
//!
//! The unit's serial port is exposed by a serial-to-TCP converter; the bridge
//! only ever speaks raw bytes over one TCP connection.

mod tcp;

pub use tcp::{connect, DeviceStream};
