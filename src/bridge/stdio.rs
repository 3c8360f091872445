//! JSON-line stdio plane.
//!
//! - **stdout**: one telemetry object per line, `{"key":"fan_level","value":2}`
//! - **stdin**: one command object per line, `{"topic":"pc_mode","payload":"3"}`
//! - **stderr**: logs (never parsed)
//!
//! Both loops are generic over the async reader/writer so tests can drive
//! them in memory.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;

use super::BridgeCommand;
use crate::command::CommandExecutor;
use crate::error::Result;
use crate::telemetry::Telemetry;

/// One inbound command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandLine {
    pub topic: String,
    /// Text or number; numbers are taken as their decimal text.
    pub payload: serde_json::Value,
}

impl CommandLine {
    /// Payload as bus text.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Write `replay` and then every telemetry event as JSON lines until the
/// channel closes.
///
/// Lagging behind the channel drops the oldest events with a warning.
pub async fn publish_telemetry<W>(
    replay: Vec<Telemetry>,
    mut telemetry: broadcast::Receiver<Telemetry>,
    mut out: W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    for event in &replay {
        write_line(&mut out, event).await?;
    }

    loop {
        match telemetry.recv().await {
            Ok(event) => write_line(&mut out, &event).await?,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Telemetry output lagged, {} events dropped", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::debug!("Telemetry channel closed");
                return Ok(());
            }
        }
    }
}

async fn write_line<W>(out: &mut W, event: &Telemetry) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    out.write_all(&line).await?;
    out.flush().await?;
    Ok(())
}

/// Read command lines and run them one at a time until end of input.
///
/// Malformed lines and failed commands are logged and skipped.
pub async fn read_commands<R>(input: R, executor: &CommandExecutor) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: CommandLine = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Bad command line: {}", e);
                continue;
            }
        };

        let payload = request.payload_text();
        tracing::info!("CMD {} = {}", request.topic, payload);

        let command = match BridgeCommand::parse(&request.topic, &payload) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("Command error: {}", e);
                continue;
            }
        };

        match command.dispatch(executor).await {
            Ok(Some(outcome)) => tracing::info!("{} -> {}", request.topic, outcome),
            Ok(None) => tracing::debug!("{}: nothing to do", request.topic),
            Err(e) => tracing::warn!("Command error: {}", e),
        }
    }

    tracing::info!("Command input closed");
    Ok(())
}
