//! Bridge boundary: inbound bus commands and the JSON-line stdio plane.
//!
//! A bus command is a topic plus a text payload. Topics may carry any prefix
//! up to a `/set/` segment (`ca350/set/climate/mode`); only the suffix is
//! matched:
//!
//! | Topic                 | Payload                         | Device command        |
//! |-----------------------|---------------------------------|-----------------------|
//! | `climate/mode`        | `off`, anything else            | fan level 1 / 2       |
//! | `climate/fan_mode`    | `away`, `low`, `medium`, `high` | fan level 1..=4       |
//! | `climate/temperature` | decimal °C                      | comfort temperature   |
//! | `pc_mode`             | integer                         | RS232 mode            |
//! | `airflow_mode`        | `in`, `out`, `in and out`       | airflow button cycles |

mod stdio;

use std::str::FromStr;

use crate::command::{CommandExecutor, CommandOutcome};
use crate::error::{BridgeError, Result};
use crate::state::{AirflowMode, FanMode};

pub use stdio::{publish_telemetry, read_commands, CommandLine};

/// Topic segment that precedes the command suffix.
const SET_SEGMENT: &str = "/set/";

/// A parsed bus command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BridgeCommand {
    /// `climate/mode`. `off` drops to fan level 1; any other mode only makes
    /// sure a fan level is set.
    HvacMode { off: bool },
    /// `climate/fan_mode`.
    FanMode(FanMode),
    /// `climate/temperature`.
    Temperature(f64),
    /// `pc_mode`.
    PcMode(u8),
    /// `airflow_mode`.
    AirflowMode(AirflowMode),
}

impl BridgeCommand {
    /// Map a topic and payload to a command.
    pub fn parse(topic: &str, payload: &str) -> Result<Self> {
        let suffix = match topic.rfind(SET_SEGMENT) {
            Some(pos) => &topic[pos + SET_SEGMENT.len()..],
            None => topic,
        };
        let payload = payload.trim();

        match suffix {
            "climate/mode" => Ok(BridgeCommand::HvacMode {
                off: payload == "off",
            }),
            // Unknown fan modes fall back to low
            "climate/fan_mode" => Ok(BridgeCommand::FanMode(
                FanMode::from_str(payload).unwrap_or(FanMode::Low),
            )),
            "climate/temperature" => payload
                .parse::<f64>()
                .map(BridgeCommand::Temperature)
                .map_err(|_| invalid(suffix, payload)),
            "pc_mode" => payload
                .parse::<u8>()
                .map(BridgeCommand::PcMode)
                .map_err(|_| invalid(suffix, payload)),
            "airflow_mode" => AirflowMode::from_str(payload).map(BridgeCommand::AirflowMode),
            _ => Err(BridgeError::InvalidCommand(format!("Unknown topic: {}", topic))),
        }
    }

    /// Run the command.
    ///
    /// Returns `None` when nothing had to be sent.
    pub async fn dispatch(&self, executor: &CommandExecutor) -> Result<Option<CommandOutcome>> {
        let outcome = match *self {
            BridgeCommand::HvacMode { off: true } => executor.set_fan_level(1).await?,
            BridgeCommand::HvacMode { off: false } => {
                if executor.state().read(|s| s.fan_level).is_some() {
                    return Ok(None);
                }
                executor.set_fan_level(FanMode::Low.level()).await?
            }
            BridgeCommand::FanMode(mode) => executor.set_fan_level(mode.level()).await?,
            BridgeCommand::Temperature(celsius) => executor.set_temperature(celsius).await?,
            BridgeCommand::PcMode(mode) => executor.set_pc_mode(mode).await?,
            BridgeCommand::AirflowMode(mode) => executor.set_airflow_mode(mode).await?,
        };
        Ok(Some(outcome))
    }
}

fn invalid(topic: &str, payload: &str) -> BridgeError {
    BridgeError::InvalidCommand(format!("Bad payload for {}: {:?}", topic, payload))
}
