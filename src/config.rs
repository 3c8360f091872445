//! Bridge configuration.
//!
//! Loaded from a JSON file; every field has a default so a partial file (or
//! no file at all) works.
//!
//! ```
//! use comfoair_bridge::config::BridgeConfig;
//!
//! let config: BridgeConfig = serde_json::from_str(r#"{ "host": "10.0.0.5" }"#).unwrap();
//! assert_eq!(config.host, "10.0.0.5");
//! assert_eq!(config.port, 8899);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::{
    VerifyPolicy, DEFAULT_AIRFLOW_CYCLES, DEFAULT_AIRFLOW_WAIT, DEFAULT_ATTEMPTS,
    DEFAULT_POLLS, DEFAULT_POLL_INTERVAL,
};
use crate::error::{BridgeError, Result};

/// Default gateway address.
pub const DEFAULT_HOST: &str = "192.168.40.130";

/// Default gateway port.
pub const DEFAULT_PORT: u16 = 8899;

/// PC modes allowed at startup.
pub const STARTUP_PC_MODES: [u8; 3] = [0, 1, 4];

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Serial gateway host.
    pub host: String,
    /// Serial gateway port.
    pub port: u16,
    /// TCP connect timeout.
    pub connect_timeout_ms: u64,
    /// RS232 mode to request after the first connection. `null` skips it.
    pub pc_mode: Option<u8>,
    /// Telemetry broadcast capacity per subscriber.
    pub telemetry_capacity: usize,
    pub reconnect: ReconnectConfig,
    pub verify: VerifyConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout_ms: 5000,
            pc_mode: Some(0),
            telemetry_capacity: 256,
            reconnect: ReconnectConfig::default(),
            verify: VerifyConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config: BridgeConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(BridgeError::Config("host must not be empty".into()));
        }
        if self.telemetry_capacity == 0 {
            return Err(BridgeError::Config("telemetry_capacity must be > 0".into()));
        }
        if self.reconnect.min_delay_ms > self.reconnect.max_delay_ms {
            return Err(BridgeError::Config(format!(
                "reconnect.min_delay_ms ({}) exceeds max_delay_ms ({})",
                self.reconnect.min_delay_ms, self.reconnect.max_delay_ms
            )));
        }
        if self.verify.attempts == 0 || self.verify.polls == 0 {
            return Err(BridgeError::Config(
                "verify.attempts and verify.polls must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Startup PC mode, falling back to 0 for modes not allowed at startup.
    pub fn startup_pc_mode(&self) -> Option<u8> {
        self.pc_mode.map(|mode| {
            if STARTUP_PC_MODES.contains(&mode) {
                mode
            } else {
                tracing::warn!("Invalid PC mode: {}", mode);
                0
            }
        })
    }
}

/// Reconnect backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_delay_ms: 2000,
            max_delay_ms: 60_000,
        }
    }
}

impl ReconnectConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Verified-send timing, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub attempts: u32,
    pub polls: u32,
    pub poll_interval_ms: u64,
    pub airflow_cycles: u32,
    pub airflow_wait_ms: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            polls: DEFAULT_POLLS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            airflow_cycles: DEFAULT_AIRFLOW_CYCLES,
            airflow_wait_ms: DEFAULT_AIRFLOW_WAIT.as_millis() as u64,
        }
    }
}

impl From<&VerifyConfig> for VerifyPolicy {
    fn from(c: &VerifyConfig) -> Self {
        VerifyPolicy {
            attempts: c.attempts,
            polls: c.polls,
            poll_interval: Duration::from_millis(c.poll_interval_ms),
            airflow_cycles: c.airflow_cycles,
            airflow_wait: Duration::from_millis(c.airflow_wait_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.port, 8899);
        assert_eq!(config.pc_mode, Some(0));
        assert!(config.reconnect.enabled);
        assert_eq!(config.reconnect.min_delay(), Duration::from_secs(2));
        assert_eq!(config.reconnect.max_delay(), Duration::from_secs(60));
        assert_eq!(VerifyPolicy::from(&config.verify), VerifyPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config: BridgeConfig = serde_json::from_str(
            r#"{ "port": 23, "pc_mode": null, "verify": { "attempts": 5 } }"#,
        )
        .unwrap();

        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, 23);
        assert_eq!(config.pc_mode, None);
        assert_eq!(config.verify.attempts, 5);
        assert_eq!(config.verify.polls, DEFAULT_POLLS);
    }

    #[test]
    fn test_startup_pc_mode_fallback() {
        let mut config = BridgeConfig::default();
        config.pc_mode = Some(4);
        assert_eq!(config.startup_pc_mode(), Some(4));
        config.pc_mode = Some(3);
        assert_eq!(config.startup_pc_mode(), Some(0));
        config.pc_mode = None;
        assert_eq!(config.startup_pc_mode(), None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BridgeConfig::default();
        config.reconnect.min_delay_ms = 10_000;
        config.reconnect.max_delay_ms = 1_000;
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));

        let mut config = BridgeConfig::default();
        config.host = " ".into();
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.verify.polls = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("ca350-config-{}.json", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, r#"{{ "host": "127.0.0.1", "reconnect": {{ "enabled": false }} }}"#).unwrap();
        drop(file);

        let config = BridgeConfig::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.host, "127.0.0.1");
        assert!(!config.reconnect.enabled);
    }

    #[test]
    fn test_load_missing_file() {
        let result = BridgeConfig::load("/nonexistent/ca350.json");
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }
}
