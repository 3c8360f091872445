//! Telemetry events published for every changed device attribute.
//!
//! Each event carries a stable [`TelemetryKey`] and a [`TelemetryValue`].
//! The bridge layer turns them into bus payloads with [`TelemetryValue`]'s
//! `Display` impl, or into JSON lines via serde.
//!
//! # Example
//!
//! ```
//! use comfoair_bridge::telemetry::{Telemetry, TelemetryKey, TelemetryValue};
//!
//! let t = Telemetry::new(TelemetryKey::OutsideTemp, TelemetryValue::decimal(20.0));
//! assert_eq!(t.key.as_str(), "outside_temp");
//! assert_eq!(t.value.to_string(), "20.0");
//! ```

use std::fmt;

use serde::Serialize;

/// Stable telemetry keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKey {
    FanLevel,
    IntakeFan,
    ExhaustFan,
    FanMode,
    HvacMode,
    ComfortTemp,
    OutsideTemp,
    SupplyTemp,
    ExtractTemp,
    ExhaustTemp,
    Bypass,
    Rs232Mode,
    AirflowMode,
    PreheaterFlap,
    FrostProtection,
    Preheater,
    FrostMinutes,
}

impl TelemetryKey {
    /// All keys, in publishing order.
    pub const ALL: [TelemetryKey; 17] = [
        TelemetryKey::FanLevel,
        TelemetryKey::IntakeFan,
        TelemetryKey::ExhaustFan,
        TelemetryKey::FanMode,
        TelemetryKey::HvacMode,
        TelemetryKey::ComfortTemp,
        TelemetryKey::OutsideTemp,
        TelemetryKey::SupplyTemp,
        TelemetryKey::ExtractTemp,
        TelemetryKey::ExhaustTemp,
        TelemetryKey::Bypass,
        TelemetryKey::Rs232Mode,
        TelemetryKey::AirflowMode,
        TelemetryKey::PreheaterFlap,
        TelemetryKey::FrostProtection,
        TelemetryKey::Preheater,
        TelemetryKey::FrostMinutes,
    ];

    /// Key as used in topic names.
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryKey::FanLevel => "fan_level",
            TelemetryKey::IntakeFan => "intake_fan",
            TelemetryKey::ExhaustFan => "exhaust_fan",
            TelemetryKey::FanMode => "fan_mode",
            TelemetryKey::HvacMode => "hvac_mode",
            TelemetryKey::ComfortTemp => "comfort_temp",
            TelemetryKey::OutsideTemp => "outside_temp",
            TelemetryKey::SupplyTemp => "supply_temp",
            TelemetryKey::ExtractTemp => "extract_temp",
            TelemetryKey::ExhaustTemp => "exhaust_temp",
            TelemetryKey::Bypass => "bypass",
            TelemetryKey::Rs232Mode => "rs232_mode",
            TelemetryKey::AirflowMode => "airflow_mode",
            TelemetryKey::PreheaterFlap => "preheater_flap",
            TelemetryKey::FrostProtection => "frost_protection",
            TelemetryKey::Preheater => "preheater",
            TelemetryKey::FrostMinutes => "frost_minutes",
        }
    }
}

impl fmt::Display for TelemetryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Telemetry value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    /// Integer reading (levels, percentages, minutes, modes).
    Integer(i64),
    /// Decimal reading, rounded to one place.
    Decimal(f64),
    /// Short enumerated string (`ON`, `away`, `In and Out`, ...).
    Text(&'static str),
}

impl TelemetryValue {
    /// Decimal value rounded to one place.
    pub fn decimal(value: f64) -> Self {
        TelemetryValue::Decimal((value * 10.0).round() / 10.0)
    }

    /// `ON`/`OFF` switch value.
    pub fn switch(on: bool) -> Self {
        TelemetryValue::Text(if on { "ON" } else { "OFF" })
    }

    /// Integer value.
    pub fn integer(value: impl Into<i64>) -> Self {
        TelemetryValue::Integer(value.into())
    }
}

impl fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryValue::Integer(v) => write!(f, "{}", v),
            TelemetryValue::Decimal(v) => write!(f, "{:.1}", v),
            TelemetryValue::Text(s) => f.write_str(s),
        }
    }
}

/// One changed device attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Telemetry {
    /// Attribute key.
    pub key: TelemetryKey,
    /// New value.
    pub value: TelemetryValue,
}

impl Telemetry {
    /// Create a new telemetry event.
    pub fn new(key: TelemetryKey, value: TelemetryValue) -> Self {
        Self { key, value }
    }

    /// Bus payload for this event.
    pub fn payload(&self) -> String {
        self.value.to_string()
    }
}
