//! # comfoair-bridge
//!
//! Bridge for ComfoAir CA350 heat-recovery ventilation units reached through
//! a serial-over-TCP gateway.
//!
//! The crate speaks the unit's framed binary protocol, keeps a decoded
//! snapshot of the device state, publishes changed attributes as telemetry
//! and issues control commands that are verified against later status
//! broadcasts (the unit never acknowledges a command directly).
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): frame codec, checksum and a resynchronizing
//!   stream parser
//! - **State** ([`state`]): decoded device snapshot shared between the
//!   receive loop and command verification
//! - **Commands** ([`command`]): send-then-observe execution with retries
//! - **Sessions** ([`connection`], [`client`]): TCP session lifecycle,
//!   writer task and supervised reconnect
//! - **Bridge** ([`bridge`]): bus command mapping and the JSON-line stdio plane
//!
//! ## Example
//!
//! ```ignore
//! use comfoair_bridge::ClientBuilder;
//!
//! #[tokio::main]
//! async fn main() -> comfoair_bridge::Result<()> {
//!     let client = ClientBuilder::new().host("192.168.40.130").start().await?;
//!     client.wait_connected().await?;
//!
//!     let outcome = client.set_fan_level(3).await?;
//!     println!("fan level 3: {}", outcome);
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod state;
pub mod telemetry;
pub mod transport;
pub mod writer;

mod client;

pub use client::{Client, ClientBuilder};
pub use command::{CommandExecutor, CommandOutcome, VerifyPolicy};
pub use config::BridgeConfig;
pub use connection::ConnectionState;
pub use error::{BridgeError, Result};
pub use state::{AirflowMode, DeviceState, FanMode, HvacMode};
pub use telemetry::{Telemetry, TelemetryKey, TelemetryValue};
