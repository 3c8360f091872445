//! Verified command execution.
//!
//! The unit never acknowledges a control frame. A command counts as accepted
//! once a later status broadcast shows its effect in [`DeviceState`], so each
//! call sends its frame and then watches the shared state:
//!
//! - up to `attempts` sends (default 3)
//! - after each send, up to `polls` checks `poll_interval` apart (default
//!   20 × 200 ms), re-checking early whenever a status frame arrives
//! - the state lock is only held for the predicate check itself
//!
//! Airflow direction has no set command. The display button is pressed and
//! released until the reported direction matches, at most `airflow_cycles`
//! times.
//!
//! Every call returns a [`CommandOutcome`]; `Err` only means the frame could
//! not be handed to a live session.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{BridgeError, Result};
use crate::protocol::commands;
use crate::state::{celsius_to_raw, AirflowMode, DeviceState, SharedState};
use crate::writer::{OutboundFrame, WriterHandle};

/// Default number of sends per verified command.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default number of state checks per send.
pub const DEFAULT_POLLS: u32 = 20;

/// Default time between state checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Default number of airflow button cycles.
pub const DEFAULT_AIRFLOW_CYCLES: u32 = 6;

/// Default wait after each airflow button cycle.
pub const DEFAULT_AIRFLOW_WAIT: Duration = Duration::from_millis(800);

/// PC modes the unit accepts on command `0x009B`.
pub const PC_MODES: [u8; 4] = [0, 1, 3, 4];

/// Timing for verified sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyPolicy {
    pub attempts: u32,
    pub polls: u32,
    pub poll_interval: Duration,
    pub airflow_cycles: u32,
    pub airflow_wait: Duration,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            polls: DEFAULT_POLLS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            airflow_cycles: DEFAULT_AIRFLOW_CYCLES,
            airflow_wait: DEFAULT_AIRFLOW_WAIT,
        }
    }
}

/// Result of a command call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The device state shows the requested effect.
    Verified,
    /// All attempts ran out without the effect showing up.
    TimedOut,
    /// The input was out of range; nothing was sent.
    Rejected,
    /// Shutdown was signalled while waiting.
    Cancelled,
}

impl CommandOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, CommandOutcome::Verified)
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommandOutcome::Verified => "verified",
            CommandOutcome::TimedOut => "timed out",
            CommandOutcome::Rejected => "rejected",
            CommandOutcome::Cancelled => "cancelled",
        })
    }
}

type Predicate = Box<dyn Fn(&DeviceState) -> bool + Send + Sync>;

/// One in-flight verified command.
pub struct PendingCommand {
    /// Human-readable name for logs.
    name: String,
    /// Encoded control frame.
    frame: OutboundFrame,
    /// Returns true once the device state shows the command took effect.
    accepted: Predicate,
    /// Sends so far.
    attempts: u32,
    /// State checks so far, across all attempts.
    polls: u32,
}

impl PendingCommand {
    pub fn new(
        name: impl Into<String>,
        frame: OutboundFrame,
        accepted: impl Fn(&DeviceState) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            frame,
            accepted: Box::new(accepted),
            attempts: 0,
            polls: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> u16 {
        self.frame.command
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }
}

/// Outcome of one polling window.
enum Poll {
    Accepted,
    Expired,
    Cancelled,
}

/// Issues control frames and verifies them against the shared state.
///
/// Cheap to clone; clones share the state, the session writer and the
/// shutdown signal.
#[derive(Clone)]
pub struct CommandExecutor {
    state: SharedState,
    /// Writer of the current session, `None` while disconnected.
    writer: watch::Receiver<Option<WriterHandle>>,
    /// Flips to `true` on shutdown.
    shutdown: watch::Receiver<bool>,
    policy: VerifyPolicy,
}

impl CommandExecutor {
    /// Create an executor.
    pub fn new(
        state: SharedState,
        writer: watch::Receiver<Option<WriterHandle>>,
        shutdown: watch::Receiver<bool>,
        policy: VerifyPolicy,
    ) -> Self {
        Self {
            state,
            writer,
            shutdown,
            policy,
        }
    }

    /// Timing in use.
    pub fn policy(&self) -> &VerifyPolicy {
        &self.policy
    }

    /// State the executor verifies against.
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Set the fan level (1..=4).
    pub async fn set_fan_level(&self, level: u8) -> Result<CommandOutcome> {
        if !(1..=4).contains(&level) {
            tracing::warn!("Wrong fan level provided: {}. No changes made", level);
            return Ok(CommandOutcome::Rejected);
        }

        let frame = OutboundFrame::new(commands::SET_FAN_LEVEL, &[level])?;
        let pending = PendingCommand::new(format!("Fan level {}", level), frame, move |s| {
            s.fan_level == Some(level)
        });
        self.send_verified(pending).await
    }

    /// Set the comfort temperature (15.0..=27.0 °C).
    pub async fn set_temperature(&self, celsius: f64) -> Result<CommandOutcome> {
        let Some(raw) = celsius_to_raw(celsius) else {
            tracing::warn!("Wrong temperature provided: {}. No changes made", celsius);
            return Ok(CommandOutcome::Rejected);
        };

        let frame = OutboundFrame::new(commands::SET_TEMPERATURE, &[raw])?;
        let pending = PendingCommand::new(format!("Temperature {}", celsius), frame, move |s| {
            s.comfort_temp_raw == Some(raw)
        });
        self.send_verified(pending).await
    }

    /// Set the RS232/PC mode (0, 1, 3 or 4).
    ///
    /// The unit reports mode 2 after mode 0 was requested.
    pub async fn set_pc_mode(&self, mode: u8) -> Result<CommandOutcome> {
        if !PC_MODES.contains(&mode) {
            tracing::warn!("Wrong PC mode provided: {}. No changes made", mode);
            return Ok(CommandOutcome::Rejected);
        }

        let expected = if mode == 0 { 2 } else { mode };
        let frame = OutboundFrame::new(commands::SET_PC_MODE, &[mode])?;
        let pending = PendingCommand::new(format!("RS232 mode {}", mode), frame, move |s| {
            s.rs232_mode == Some(expected)
        });
        self.send_verified(pending).await
    }

    /// Cycle the airflow button until the unit reports `mode`.
    pub async fn set_airflow_mode(&self, mode: AirflowMode) -> Result<CommandOutcome> {
        if mode == AirflowMode::Unknown {
            tracing::warn!("Invalid airflow mode!");
            return Ok(CommandOutcome::Rejected);
        }

        let reached = |state: &SharedState| state.read(|s| s.airflow_mode == Some(mode));

        if reached(&self.state) {
            tracing::info!("Airflow mode already {}", mode);
            return Ok(CommandOutcome::Verified);
        }

        let mut shutdown = self.shutdown.clone();

        for cycle in 1..=self.policy.airflow_cycles {
            self.press_airflow_button().await?;

            tokio::select! {
                _ = cancelled(&mut shutdown) => return Ok(CommandOutcome::Cancelled),
                _ = tokio::time::sleep(self.policy.airflow_wait) => {}
            }

            if reached(&self.state) {
                tracing::info!("Airflow mode {} verified after {} cycles", mode, cycle);
                return Ok(CommandOutcome::Verified);
            }
        }

        tracing::warn!("Airflow mode change failed: {}", mode);
        Ok(CommandOutcome::TimedOut)
    }

    /// Send one press/release pair of the display's airflow button.
    pub async fn press_airflow_button(&self) -> Result<()> {
        for payload in [
            commands::AIRFLOW_BUTTON_PRESS,
            commands::AIRFLOW_BUTTON_RELEASE,
        ] {
            let frame = OutboundFrame::new(commands::BUTTON, &payload)?;
            self.send(frame).await?;
        }
        tracing::info!("Sent airflow_mode_button");
        Ok(())
    }

    /// Send a frame, then wait for `accepted` to hold; retry per policy.
    pub async fn send_verified(&self, mut pending: PendingCommand) -> Result<CommandOutcome> {
        let mut updates = self.state.subscribe();

        while pending.attempts < self.policy.attempts {
            pending.attempts += 1;
            self.send(pending.frame.clone()).await?;
            tracing::info!("Sent {} (try {})", pending.name, pending.attempts);

            match self.poll(&mut pending, &mut updates).await {
                Poll::Accepted => {
                    tracing::info!("{} verified", pending.name);
                    tracing::debug!(
                        "{} took {} tries, {} checks",
                        pending.name,
                        pending.attempts,
                        pending.polls
                    );
                    return Ok(CommandOutcome::Verified);
                }
                Poll::Cancelled => {
                    tracing::info!("{} cancelled", pending.name);
                    return Ok(CommandOutcome::Cancelled);
                }
                Poll::Expired => {}
            }
        }

        tracing::warn!("{} failed after {} tries", pending.name, pending.attempts);
        Ok(CommandOutcome::TimedOut)
    }

    /// Check the predicate until it holds or the polling window closes.
    ///
    /// Checks on every tick and on every applied status frame.
    async fn poll(
        &self,
        pending: &mut PendingCommand,
        updates: &mut watch::Receiver<u64>,
    ) -> Poll {
        let interval = self.policy.poll_interval;
        let deadline = Instant::now() + interval * self.policy.polls;
        let mut next_tick = Instant::now() + interval;
        let mut shutdown = self.shutdown.clone();

        loop {
            pending.polls += 1;
            if self.state.read(|s| (pending.accepted)(s)) {
                return Poll::Accepted;
            }

            let now = Instant::now();
            if now >= deadline {
                return Poll::Expired;
            }
            if now >= next_tick {
                next_tick = now + interval;
            }

            tokio::select! {
                _ = cancelled(&mut shutdown) => return Poll::Cancelled,
                Ok(()) = updates.changed() => {}
                _ = tokio::time::sleep_until(next_tick.min(deadline)) => {}
            }
        }
    }

    async fn send(&self, frame: OutboundFrame) -> Result<()> {
        let writer = self.writer.borrow().clone();
        match writer {
            Some(writer) => writer.send(frame).await,
            None => Err(BridgeError::NotConnected),
        }
    }
}

/// Resolves once shutdown is signalled or the signal's owner is gone.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, checksum, Frame, FrameBuffer};
    use crate::writer::spawn_writer_task;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn status(command: u16, payload: &[u8]) -> Frame {
        Frame::new(
            command,
            Bytes::copy_from_slice(payload),
            checksum(command, payload.len() as u8, payload),
        )
    }

    fn ventilation(level: u8) -> Frame {
        let mut payload = [0u8; 14];
        payload[8] = level;
        status(commands::VENTILATION_STATUS, &payload)
    }

    fn display(flags: u8) -> Frame {
        let mut payload = [0u8; 10];
        payload[9] = flags;
        status(commands::DISPLAY_STATUS, &payload)
    }

    struct Harness {
        executor: CommandExecutor,
        state: SharedState,
        shutdown: watch::Sender<bool>,
        _writer: watch::Sender<Option<WriterHandle>>,
        device: DuplexStream,
    }

    fn harness() -> Harness {
        let (client, device) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, 16);
        let (writer_tx, writer_rx) = watch::channel(Some(handle));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = SharedState::new();
        let executor =
            CommandExecutor::new(state.clone(), writer_rx, shutdown_rx, VerifyPolicy::default());

        Harness {
            executor,
            state,
            shutdown: shutdown_tx,
            _writer: writer_tx,
            device,
        }
    }

    /// Fake unit: answers control frames by applying a status frame.
    fn spawn_device(
        mut device: DuplexStream,
        state: SharedState,
        respond: impl Fn(&Frame) -> Option<Frame> + Send + 'static,
    ) -> Arc<AtomicUsize> {
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();

        tokio::spawn(async move {
            let mut parser = FrameBuffer::new();
            let mut buf = [0u8; 256];
            loop {
                let n = match device.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                for frame in parser.push(&buf[..n]) {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if let Some(reply) = respond(&frame) {
                        state.apply_frame(&reply);
                    }
                }
            }
        });

        received
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_level_verified() {
        let h = harness();
        let received = spawn_device(h.device, h.state.clone(), |frame| {
            (frame.command == commands::SET_FAN_LEVEL).then(|| ventilation(frame.payload()[0]))
        });

        let outcome = h.executor.set_fan_level(3).await.unwrap();

        assert_eq!(outcome, CommandOutcome::Verified);
        assert_eq!(h.state.read(|s| s.fan_level), Some(3));
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_level_out_of_range_sends_nothing() {
        let mut h = harness();

        for level in [0, 5] {
            let outcome = h.executor.set_fan_level(level).await.unwrap();
            assert_eq!(outcome, CommandOutcome::Rejected);
        }

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_millis(100), h.device.read(&mut buf)).await;
        assert!(read.is_err(), "no bytes should reach the device");
        assert_eq!(h.state.snapshot(), DeviceState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_command_retries_then_times_out() {
        let h = harness();
        let received = spawn_device(h.device, h.state.clone(), |_| None);

        let start = Instant::now();
        let outcome = h.executor.set_fan_level(2).await.unwrap();

        assert_eq!(outcome, CommandOutcome::TimedOut);
        assert_eq!(received.load(Ordering::SeqCst), 3);
        // 3 attempts × 20 checks × 200 ms
        assert!(start.elapsed() >= Duration::from_secs(12));
        assert!(start.elapsed() < Duration::from_secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_attempt_succeeds() {
        let h = harness();
        let sends = Arc::new(AtomicUsize::new(0));
        let seen = sends.clone();
        spawn_device(h.device, h.state.clone(), move |frame| {
            // Ignore the first frame, accept the retry
            let n = seen.fetch_add(1, Ordering::SeqCst);
            (n >= 1).then(|| status(commands::RS232_STATUS, &[frame.payload()[0]]))
        });

        let outcome = h.executor.set_pc_mode(3).await.unwrap();

        assert_eq!(outcome, CommandOutcome::Verified);
        assert_eq!(sends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pc_mode_zero_verified_by_mode_two() {
        let h = harness();
        spawn_device(h.device, h.state.clone(), |frame| {
            let requested = frame.payload()[0];
            let reported = if requested == 0 { 2 } else { requested };
            Some(status(commands::RS232_STATUS, &[reported]))
        });

        let outcome = h.executor.set_pc_mode(0).await.unwrap();

        assert_eq!(outcome, CommandOutcome::Verified);
        assert_eq!(h.state.read(|s| s.rs232_mode), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pc_mode_zero_not_verified_by_mode_zero() {
        let h = harness();
        spawn_device(h.device, h.state.clone(), |_| {
            Some(status(commands::RS232_STATUS, &[0]))
        });

        let outcome = h.executor.set_pc_mode(0).await.unwrap();
        assert_eq!(outcome, CommandOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pc_mode_rejects_unknown_modes() {
        let h = harness();
        assert_eq!(h.executor.set_pc_mode(2).await.unwrap(), CommandOutcome::Rejected);
        assert_eq!(h.executor.set_pc_mode(5).await.unwrap(), CommandOutcome::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_temperature_verified_on_raw_value() {
        let h = harness();
        spawn_device(h.device, h.state.clone(), |frame| {
            (frame.command == commands::SET_TEMPERATURE).then(|| {
                let raw = frame.payload()[0];
                status(commands::TEMPERATURE_STATUS, &[raw, 0x50, 0x50, 0x50, 0x50, 0, 0, 0, 0])
            })
        });

        let outcome = h.executor.set_temperature(21.5).await.unwrap();

        assert_eq!(outcome, CommandOutcome::Verified);
        assert_eq!(h.state.read(|s| s.comfort_temp_raw), Some(83));
        assert_eq!(h.state.read(|s| s.comfort_temp()), Some(21.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_temperature_out_of_range() {
        let h = harness();
        assert_eq!(h.executor.set_temperature(14.5).await.unwrap(), CommandOutcome::Rejected);
        assert_eq!(h.executor.set_temperature(30.0).await.unwrap(), CommandOutcome::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_airflow_mode_cycles_until_match() {
        let h = harness();
        // In -> Out -> In and Out, one step per press
        let presses = Arc::new(AtomicUsize::new(0));
        let counter = presses.clone();
        h.state.apply_frame(&display(0x40));
        spawn_device(h.device, h.state.clone(), move |frame| {
            if frame.command != commands::BUTTON || frame.payload()[1] != 0x06 {
                return None;
            }
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Some(display([0x80, 0xC0, 0x40][n % 3]))
        });

        let outcome = h.executor.set_airflow_mode(AirflowMode::InAndOut).await.unwrap();

        assert_eq!(outcome, CommandOutcome::Verified);
        assert_eq!(presses.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_airflow_mode_already_set() {
        let h = harness();
        h.state.apply_frame(&display(0x80));
        let received = spawn_device(h.device, h.state.clone(), |_| None);

        let outcome = h.executor.set_airflow_mode(AirflowMode::Out).await.unwrap();

        assert_eq!(outcome, CommandOutcome::Verified);
        tokio::task::yield_now().await;
        assert_eq!(received.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_airflow_mode_gives_up_after_cycles() {
        let h = harness();
        let received = spawn_device(h.device, h.state.clone(), |_| None);

        let outcome = h.executor.set_airflow_mode(AirflowMode::In).await.unwrap();

        assert_eq!(outcome, CommandOutcome::TimedOut);
        // press + release per cycle
        assert_eq!(received.load(Ordering::SeqCst), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_verification() {
        let h = harness();
        spawn_device(h.device, h.state.clone(), |_| None);

        let executor = h.executor.clone();
        let task = tokio::spawn(async move { executor.set_fan_level(4).await });

        tokio::time::sleep(Duration::from_millis(500)).await;
        h.shutdown.send(true).unwrap();

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, CommandOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_connected() {
        let (_writer_tx, writer_rx) = watch::channel(None);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let executor =
            CommandExecutor::new(SharedState::new(), writer_rx, shutdown_rx, VerifyPolicy::default());

        let result = executor.set_fan_level(2).await;
        assert!(matches!(result, Err(BridgeError::NotConnected)));
    }

    #[test]
    fn test_pending_command_accessors() {
        let frame = OutboundFrame::new(commands::SET_FAN_LEVEL, &[1]).unwrap();
        let pending = PendingCommand::new("Fan level 1", frame, |s| s.fan_level == Some(1));
        assert_eq!(pending.name(), "Fan level 1");
        assert_eq!(pending.command(), commands::SET_FAN_LEVEL);
        assert_eq!(pending.attempts(), 0);
        assert_eq!(pending.polls(), 0);
        assert_eq!(
            build_frame(commands::SET_FAN_LEVEL, &[1]).unwrap(),
            pending.frame.bytes.to_vec()
        );
    }
}
