//! Device state model.
//!
//! [`DeviceState`] is the bridge's latest snapshot of the unit. It is written
//! only by the receive loop (via [`SharedState::apply_frame`]) and read by
//! command verification and the telemetry path. [`SharedState`] guards the
//! whole record with one mutex and publishes a version counter on a `watch`
//! channel so waiters can react to updates instead of sleeping blindly.

mod decode;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::error::BridgeError;
use crate::protocol::Frame;
use crate::telemetry::{Telemetry, TelemetryKey, TelemetryValue};

pub use decode::{apply_frame, celsius_to_raw, raw_to_celsius, MAX_COMFORT_TEMP, MIN_COMFORT_TEMP};

/// Direction of the air flow as shown on the unit's display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AirflowMode {
    /// Intake only.
    In,
    /// Exhaust only.
    Out,
    /// Intake and exhaust.
    InAndOut,
    /// Neither flag set.
    Unknown,
}

impl AirflowMode {
    /// Display flag for an active intake.
    pub const INTAKE_FLAG: u8 = 0x40;
    /// Display flag for an active exhaust.
    pub const EXHAUST_FLAG: u8 = 0x80;

    /// Decode the display status flags byte.
    pub fn from_display_flags(flags: u8) -> Self {
        let intake = flags & Self::INTAKE_FLAG != 0;
        let exhaust = flags & Self::EXHAUST_FLAG != 0;
        match (intake, exhaust) {
            (true, true) => AirflowMode::InAndOut,
            (true, false) => AirflowMode::In,
            (false, true) => AirflowMode::Out,
            (false, false) => AirflowMode::Unknown,
        }
    }

    /// Label used on the bus.
    pub fn as_str(&self) -> &'static str {
        match self {
            AirflowMode::In => "In",
            AirflowMode::Out => "Out",
            AirflowMode::InAndOut => "In and Out",
            AirflowMode::Unknown => "unknown",
        }
    }
}

impl fmt::Display for AirflowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AirflowMode {
    type Err = BridgeError;

    /// Parse a requested mode. `Unknown` cannot be requested.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in" => Ok(AirflowMode::In),
            "out" => Ok(AirflowMode::Out),
            "in and out" => Ok(AirflowMode::InAndOut),
            other => Err(BridgeError::InvalidCommand(format!(
                "Invalid airflow mode: {:?}",
                other
            ))),
        }
    }
}

/// Fan mode derived from the fan level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanMode {
    Away,
    Low,
    Medium,
    High,
}

impl FanMode {
    /// Level 1 is away, 2 low, 3 medium, anything else high.
    pub fn from_level(level: u8) -> Self {
        match level {
            1 => FanMode::Away,
            2 => FanMode::Low,
            3 => FanMode::Medium,
            _ => FanMode::High,
        }
    }

    /// Fan level to request for this mode.
    pub fn level(&self) -> u8 {
        match self {
            FanMode::Away => 1,
            FanMode::Low => 2,
            FanMode::Medium => 3,
            FanMode::High => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FanMode::Away => "away",
            FanMode::Low => "low",
            FanMode::Medium => "medium",
            FanMode::High => "high",
        }
    }
}

impl FromStr for FanMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "away" => Ok(FanMode::Away),
            "low" => Ok(FanMode::Low),
            "medium" => Ok(FanMode::Medium),
            "high" => Ok(FanMode::High),
            other => Err(BridgeError::InvalidCommand(format!(
                "Invalid fan mode: {:?}",
                other
            ))),
        }
    }
}

/// Climate mode derived from the fan level (`off` at level 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvacMode {
    Off,
    FanOnly,
}

impl HvacMode {
    pub fn from_level(level: u8) -> Self {
        if level == 1 {
            HvacMode::Off
        } else {
            HvacMode::FanOnly
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HvacMode::Off => "off",
            HvacMode::FanOnly => "fan_only",
        }
    }
}

/// Preheater flap position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlapState {
    Closed,
    Open,
    Unknown,
    /// Any value the unit is not documented to send.
    Other(u8),
}

impl FlapState {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => FlapState::Closed,
            1 => FlapState::Open,
            2 => FlapState::Unknown,
            other => FlapState::Other(other),
        }
    }

    /// Telemetry value: label for known states, raw integer otherwise.
    pub fn telemetry(&self) -> TelemetryValue {
        match self {
            FlapState::Closed => TelemetryValue::Text("closed"),
            FlapState::Open => TelemetryValue::Text("open"),
            FlapState::Unknown => TelemetryValue::Text("unknown"),
            FlapState::Other(raw) => TelemetryValue::integer(*raw),
        }
    }
}

impl fmt::Display for FlapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.telemetry())
    }
}

/// Preheater and frost protection readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreheaterStatus {
    pub flap: FlapState,
    pub frost_protection: bool,
    pub heating: bool,
    pub frost_minutes: u16,
}

/// Latest known device attributes. Fields start unset and are only ever
/// overwritten by decoded status frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    /// Fan level, 1..=4 on a healthy unit.
    pub fan_level: Option<u8>,
    pub intake_fan: Option<u8>,
    pub exhaust_fan: Option<u8>,
    /// Comfort setpoint as the raw byte the unit reports.
    pub comfort_temp_raw: Option<u8>,
    pub outside_temp: Option<f64>,
    pub supply_temp: Option<f64>,
    pub extract_temp: Option<f64>,
    pub exhaust_temp: Option<f64>,
    pub bypass_open: Option<bool>,
    pub rs232_mode: Option<u8>,
    pub airflow_mode: Option<AirflowMode>,
    pub preheater: Option<PreheaterStatus>,
}

impl DeviceState {
    /// Comfort setpoint in °C.
    pub fn comfort_temp(&self) -> Option<f64> {
        self.comfort_temp_raw.map(raw_to_celsius)
    }

    pub fn fan_mode(&self) -> Option<FanMode> {
        self.fan_level.map(FanMode::from_level)
    }

    pub fn hvac_mode(&self) -> Option<HvacMode> {
        self.fan_level.map(HvacMode::from_level)
    }
}

struct Inner {
    state: DeviceState,
    /// Last value published per key, for change detection.
    published: BTreeMap<TelemetryKey, TelemetryValue>,
}

/// Mutex-guarded device state shared by the receive loop and commands.
///
/// Cheap to clone. Never hold the guard across an `.await`; all accessors
/// here take and release the lock within the call.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<Mutex<Inner>>,
    version: Arc<watch::Sender<u64>>,
}

impl SharedState {
    /// Create an empty state.
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: DeviceState::default(),
                published: BTreeMap::new(),
            })),
            version: Arc::new(version),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Writers never leave the record half-updated; poisoning is ignored.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a checksum-valid frame and return the telemetry that changed.
    pub fn apply_frame(&self, frame: &Frame) -> Vec<Telemetry> {
        let mut changed = Vec::new();
        {
            let mut inner = self.lock();
            let Inner { state, published } = &mut *inner;

            for t in apply_frame(state, frame) {
                if published.get(&t.key) != Some(&t.value) {
                    published.insert(t.key, t.value.clone());
                    changed.push(t);
                }
            }
        }

        self.version.send_modify(|v| *v += 1);
        changed
    }

    /// Run `f` against the current state under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&DeviceState) -> R) -> R {
        f(&self.lock().state)
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> DeviceState {
        self.read(DeviceState::clone)
    }

    /// Every value published so far, in key order. Useful for republishing
    /// after a bus reconnect.
    pub fn telemetry(&self) -> Vec<Telemetry> {
        self.lock()
            .published
            .iter()
            .map(|(k, v)| Telemetry::new(*k, v.clone()))
            .collect()
    }

    /// Receiver that is notified after every applied frame.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Number of frames applied so far.
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
