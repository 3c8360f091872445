//! Status-frame decoding.
//!
//! Maps checksum-valid status frames onto [`DeviceState`] fields and returns
//! the telemetry values each frame carries. Frames shorter than their
//! command's minimum length are ignored.

use crate::protocol::{commands, hex_dump, Frame};
use crate::telemetry::{Telemetry, TelemetryKey, TelemetryValue};

use super::{AirflowMode, DeviceState, FanMode, FlapState, HvacMode, PreheaterStatus};

/// Minimum payload lengths per status command.
const MIN_VENTILATION_LEN: usize = 14;
const MIN_TEMPERATURE_LEN: usize = 9;
const MIN_BYPASS_LEN: usize = 7;
const MIN_RS232_LEN: usize = 1;
const MIN_DISPLAY_LEN: usize = 10;
const MIN_PREHEATER_LEN: usize = 6;

/// Lowest settable comfort temperature in °C.
pub const MIN_COMFORT_TEMP: f64 = 15.0;

/// Highest settable comfort temperature in °C.
pub const MAX_COMFORT_TEMP: f64 = 27.0;

/// Convert a raw temperature byte to °C (`raw / 2 - 20`).
#[inline]
pub fn raw_to_celsius(raw: u8) -> f64 {
    raw as f64 / 2.0 - 20.0
}

/// Convert °C to the raw temperature byte (`celsius * 2 + 40`).
///
/// Rounds half to even. Returns `None` outside the settable range.
pub fn celsius_to_raw(celsius: f64) -> Option<u8> {
    if !(MIN_COMFORT_TEMP..=MAX_COMFORT_TEMP).contains(&celsius) {
        return None;
    }
    Some((celsius * 2.0 + 40.0).round_ties_even() as u8)
}

/// Apply one checksum-valid frame to the state.
///
/// Returns every telemetry value the frame carries, changed or not.
pub fn apply_frame(state: &mut DeviceState, frame: &Frame) -> Vec<Telemetry> {
    let data = frame.payload();
    tracing::debug!("RX {:04x} DATA={}", frame.command, hex_dump(data));

    match frame.command {
        commands::VENTILATION_STATUS if data.len() >= MIN_VENTILATION_LEN => {
            ventilation(state, data)
        }
        commands::TEMPERATURE_STATUS if data.len() >= MIN_TEMPERATURE_LEN => {
            temperature(state, data)
        }
        commands::BYPASS_STATUS if data.len() >= MIN_BYPASS_LEN => bypass(state, data),
        commands::RS232_STATUS if data.len() >= MIN_RS232_LEN => rs232(state, data),
        commands::DISPLAY_STATUS if data.len() >= MIN_DISPLAY_LEN => display(state, data),
        commands::PREHEATER_STATUS if data.len() >= MIN_PREHEATER_LEN => preheater(state, data),
        commands::VENTILATION_STATUS
        | commands::TEMPERATURE_STATUS
        | commands::BYPASS_STATUS
        | commands::RS232_STATUS
        | commands::DISPLAY_STATUS
        | commands::PREHEATER_STATUS => {
            tracing::debug!(
                "Short status frame {:04x} ({} bytes), ignored",
                frame.command,
                data.len()
            );
            Vec::new()
        }
        _ => Vec::new(),
    }
}

fn ventilation(state: &mut DeviceState, data: &[u8]) -> Vec<Telemetry> {
    let exhaust = data[6];
    let intake = data[7];
    let level = data[8];

    tracing::info!("Exhaust(%) = {}", exhaust);
    tracing::info!("Intake(%) = {}", intake);
    tracing::info!("Fan = {}", level);

    state.fan_level = Some(level);
    state.intake_fan = Some(intake);
    state.exhaust_fan = Some(exhaust);

    vec![
        Telemetry::new(TelemetryKey::FanLevel, TelemetryValue::integer(level)),
        Telemetry::new(TelemetryKey::IntakeFan, TelemetryValue::integer(intake)),
        Telemetry::new(TelemetryKey::ExhaustFan, TelemetryValue::integer(exhaust)),
        Telemetry::new(
            TelemetryKey::FanMode,
            TelemetryValue::Text(FanMode::from_level(level).as_str()),
        ),
        Telemetry::new(
            TelemetryKey::HvacMode,
            TelemetryValue::Text(HvacMode::from_level(level).as_str()),
        ),
    ]
}

fn temperature(state: &mut DeviceState, data: &[u8]) -> Vec<Telemetry> {
    let comfort = raw_to_celsius(data[0]);
    let outside = raw_to_celsius(data[1]);
    let supply = raw_to_celsius(data[2]);
    let extract = raw_to_celsius(data[3]);
    let exhaust = raw_to_celsius(data[4]);

    tracing::info!("Comfort Temp. = {} °C", comfort);
    tracing::info!("Outside Temp. = {} °C", outside);
    tracing::info!("Supply Temp. = {} °C", supply);
    tracing::info!("Extract Temp. = {} °C", extract);
    tracing::info!("Exhaust Temp. = {} °C", exhaust);

    state.comfort_temp_raw = Some(data[0]);
    state.outside_temp = Some(outside);
    state.supply_temp = Some(supply);
    state.extract_temp = Some(extract);
    state.exhaust_temp = Some(exhaust);

    vec![
        Telemetry::new(TelemetryKey::ComfortTemp, TelemetryValue::decimal(comfort)),
        Telemetry::new(TelemetryKey::OutsideTemp, TelemetryValue::decimal(outside)),
        Telemetry::new(TelemetryKey::SupplyTemp, TelemetryValue::decimal(supply)),
        Telemetry::new(TelemetryKey::ExtractTemp, TelemetryValue::decimal(extract)),
        Telemetry::new(TelemetryKey::ExhaustTemp, TelemetryValue::decimal(exhaust)),
    ]
}

fn bypass(state: &mut DeviceState, data: &[u8]) -> Vec<Telemetry> {
    let open = data[6] == 1;
    tracing::info!("Bypass = {}", data[6]);

    state.bypass_open = Some(open);

    vec![Telemetry::new(
        TelemetryKey::Bypass,
        TelemetryValue::switch(open),
    )]
}

fn rs232(state: &mut DeviceState, data: &[u8]) -> Vec<Telemetry> {
    let mode = data[0];
    tracing::info!("RS232 mode = {}", mode);

    state.rs232_mode = Some(mode);

    vec![Telemetry::new(
        TelemetryKey::Rs232Mode,
        TelemetryValue::integer(mode),
    )]
}

fn display(state: &mut DeviceState, data: &[u8]) -> Vec<Telemetry> {
    let mode = AirflowMode::from_display_flags(data[9]);
    tracing::info!("Airflow mode = {}", mode);

    state.airflow_mode = Some(mode);

    vec![Telemetry::new(
        TelemetryKey::AirflowMode,
        TelemetryValue::Text(mode.as_str()),
    )]
}

fn preheater(state: &mut DeviceState, data: &[u8]) -> Vec<Telemetry> {
    let status = PreheaterStatus {
        flap: FlapState::from_raw(data[0]),
        frost_protection: data[1] == 1,
        heating: data[2] == 1,
        frost_minutes: u16::from_be_bytes([data[3], data[4]]),
    };

    tracing::info!("Preheater flap = {}", status.flap);
    tracing::info!(
        "Frost protection = {}",
        if status.frost_protection { "ON" } else { "OFF" }
    );
    tracing::info!(
        "Preheater active = {}",
        if status.heating { "ON" } else { "OFF" }
    );
    tracing::info!("Frost minutes = {} min", status.frost_minutes);

    state.preheater = Some(status);

    vec![
        Telemetry::new(TelemetryKey::PreheaterFlap, status.flap.telemetry()),
        Telemetry::new(
            TelemetryKey::FrostProtection,
            TelemetryValue::switch(status.frost_protection),
        ),
        Telemetry::new(TelemetryKey::Preheater, TelemetryValue::switch(status.heating)),
        Telemetry::new(
            TelemetryKey::FrostMinutes,
            TelemetryValue::integer(status.frost_minutes),
        ),
    ]
}
