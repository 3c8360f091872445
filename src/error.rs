//! Error types for comfoair-bridge.

use thiserror::Error;

/// Main error type for all bridge operations.
///
/// Per-frame faults (bad escapes, lost sync, checksum mismatches) never show
/// up here; the parser absorbs them. These variants cover the transport,
/// configuration and bridge-boundary failures.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config and stdio plane).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (unencodable frame, oversized payload, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No device session is currently established.
    #[error("Not connected to device")]
    NotConnected,

    /// TCP connect did not complete in time.
    #[error("Connect timed out after {0} ms")]
    ConnectTimeout(u64),

    /// Inbound bridge command could not be mapped to a device command.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Invalid configuration value.
    #[error("Config error: {0}")]
    Config(String),
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;
