//! Client builder and supervisor.
//!
//! The [`ClientBuilder`] provides a fluent API for configuring the bridge and
//! building the client. The [`Client`] manages the lifecycle:
//! 1. Open the first device session
//! 2. Request the startup PC mode
//! 3. Supervise the session, reconnecting with exponential backoff
//! 4. Expose verified commands and the telemetry stream
//!
//! # Example
//!
//! ```ignore
//! use comfoair_bridge::{AirflowMode, Client};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .host("192.168.40.130")
//!         .port(8899)
//!         .start()
//!         .await?;
//!
//!     let mut telemetry = client.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(t) = telemetry.recv().await {
//!             println!("{} = {}", t.key, t.value);
//!         }
//!     });
//!
//!     client.set_fan_level(2).await?;
//!     client.set_airflow_mode(AirflowMode::InAndOut).await?;
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::command::{CommandExecutor, CommandOutcome, VerifyPolicy};
use crate::config::{BridgeConfig, ReconnectConfig};
use crate::connection::{Connection, ConnectionState, SessionContext};
use crate::error::{BridgeError, Result};
use crate::state::{AirflowMode, DeviceState};
use crate::telemetry::Telemetry;

/// Builder for configuring and creating a bridge client.
pub struct ClientBuilder {
    config: BridgeConfig,
}

impl ClientBuilder {
    /// Create a new client builder with default settings.
    pub fn new() -> Self {
        Self {
            config: BridgeConfig::default(),
        }
    }

    /// Start from a loaded configuration.
    pub fn from_config(config: BridgeConfig) -> Self {
        Self { config }
    }

    /// Gateway host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Gateway port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// TCP connect timeout.
    ///
    /// Default: 5 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// RS232 mode to request after the first connection, or `None` to skip.
    ///
    /// Default: `Some(0)`
    pub fn pc_mode(mut self, mode: Option<u8>) -> Self {
        self.config.pc_mode = mode;
        self
    }

    /// Enable or disable reconnecting after the session drops.
    ///
    /// Default: enabled
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect.enabled = enabled;
        self
    }

    /// Reconnect backoff bounds.
    ///
    /// Default: 2 s doubling up to 60 s
    pub fn reconnect_delay(mut self, min: Duration, max: Duration) -> Self {
        self.config.reconnect.min_delay_ms = min.as_millis() as u64;
        self.config.reconnect.max_delay_ms = max.as_millis() as u64;
        self
    }

    /// Verified-send timing.
    pub fn verify_policy(mut self, policy: VerifyPolicy) -> Self {
        self.config.verify.attempts = policy.attempts;
        self.config.verify.polls = policy.polls;
        self.config.verify.poll_interval_ms = policy.poll_interval.as_millis() as u64;
        self.config.verify.airflow_cycles = policy.airflow_cycles;
        self.config.verify.airflow_wait_ms = policy.airflow_wait.as_millis() as u64;
        self
    }

    /// Telemetry broadcast capacity.
    ///
    /// Default: 256
    pub fn telemetry_capacity(mut self, capacity: usize) -> Self {
        self.config.telemetry_capacity = capacity;
        self
    }

    /// Build and start the client.
    ///
    /// Fails if the configuration is invalid, or if the first connection
    /// fails while reconnecting is disabled. With reconnecting enabled a
    /// failed first connection is retried in the background.
    pub async fn start(self) -> Result<Client> {
        self.config.validate()?;
        Client::start(self.config).await
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running bridge client.
pub struct Client {
    ctx: SessionContext,
    executor: CommandExecutor,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    async fn start(config: BridgeConfig) -> Result<Self> {
        let ctx = SessionContext::new(config.telemetry_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let executor = CommandExecutor::new(
            ctx.state.clone(),
            ctx.writer.subscribe(),
            shutdown_rx.clone(),
            VerifyPolicy::from(&config.verify),
        );

        tracing::info!("Connecting to CA350 at {}:{}...", config.host, config.port);
        let first = match Connection::open(
            &config.host,
            config.port,
            config.connect_timeout(),
            &ctx,
        )
        .await
        {
            Ok(conn) => Some(conn),
            Err(e) if config.reconnect.enabled => {
                tracing::warn!("CA350 connect failed: {}", e);
                None
            }
            Err(e) => return Err(e),
        };

        let supervisor = Supervisor {
            config,
            ctx: ctx.clone(),
            executor: executor.clone(),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(supervisor.run(first));

        Ok(Client {
            ctx,
            executor,
            shutdown_tx,
            supervisor: Mutex::new(Some(task)),
        })
    }

    /// Set the fan level (1..=4).
    pub async fn set_fan_level(&self, level: u8) -> Result<CommandOutcome> {
        self.executor.set_fan_level(level).await
    }

    /// Set the comfort temperature (15.0..=27.0 °C).
    pub async fn set_temperature(&self, celsius: f64) -> Result<CommandOutcome> {
        self.executor.set_temperature(celsius).await
    }

    /// Set the RS232/PC mode (0, 1, 3 or 4).
    pub async fn set_pc_mode(&self, mode: u8) -> Result<CommandOutcome> {
        self.executor.set_pc_mode(mode).await
    }

    /// Cycle the airflow direction until it matches `mode`.
    pub async fn set_airflow_mode(&self, mode: AirflowMode) -> Result<CommandOutcome> {
        self.executor.set_airflow_mode(mode).await
    }

    /// Executor handle, for callers that outlive a borrow of the client.
    pub fn executor(&self) -> CommandExecutor {
        self.executor.clone()
    }

    /// Subscribe to telemetry. One event per changed attribute.
    pub fn subscribe(&self) -> broadcast::Receiver<Telemetry> {
        self.ctx.telemetry.subscribe()
    }

    /// Copy of the current device state.
    pub fn snapshot(&self) -> DeviceState {
        self.ctx.state.snapshot()
    }

    /// Latest value of every attribute published so far.
    pub fn telemetry(&self) -> Vec<Telemetry> {
        self.ctx.state.telemetry()
    }

    /// Subscribe to telemetry, starting with the current value of every
    /// attribute.
    ///
    /// The receiver is created before the values are read, so an attribute
    /// that changes in between shows up in the stream as well. Nothing
    /// published before the call is lost.
    pub fn subscribe_with_snapshot(&self) -> (Vec<Telemetry>, broadcast::Receiver<Telemetry>) {
        let receiver = self.ctx.telemetry.subscribe();
        (self.ctx.state.telemetry(), receiver)
    }

    /// Command codes seen on the wire, sorted.
    pub fn seen_commands(&self) -> Vec<u16> {
        let seen: BTreeSet<u16> = self
            .ctx
            .seen_commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        seen.into_iter().collect()
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.ctx.status.borrow()
    }

    /// Receiver for connection state changes.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.ctx.status.subscribe()
    }

    /// Wait until a session is connected.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut status = self.ctx.status.subscribe();
        status
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .map(|_| ())
            .map_err(|_| BridgeError::ConnectionClosed)
    }

    /// Stop the supervisor and the current session.
    ///
    /// In-flight commands return `Cancelled`.
    pub async fn shutdown(&self) {
        tracing::info!("Stopping CA350 client...");
        let _ = self.shutdown_tx.send(true);

        let task = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Supervisor task failed: {}", e);
            }
        }
    }
}

/// Owns the session loop.
struct Supervisor {
    config: BridgeConfig,
    ctx: SessionContext,
    executor: CommandExecutor,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self, first: Option<Connection>) {
        let mut backoff = Backoff::new(&self.config.reconnect);
        let mut conn = first;
        let mut pc_mode_pending = self.config.startup_pc_mode();

        loop {
            if let Some(session) = conn.take() {
                backoff.reset();
                if let Some(mode) = pc_mode_pending.take() {
                    self.request_pc_mode(mode);
                }
                if !self.serve(session).await {
                    break;
                }
            }

            if !self.config.reconnect.enabled || self.stopping() {
                break;
            }

            let delay = backoff.next_delay();
            tracing::info!("Reconnecting to CA350 in {:?}", delay);
            tokio::select! {
                _ = self.shutdown.wait_for(|stop| *stop) => break,
                _ = tokio::time::sleep(delay) => {}
            }

            conn = self.connect().await;
        }

        tracing::info!("CA350 supervisor stopped");
    }

    async fn connect(&self) -> Option<Connection> {
        match Connection::open(
            &self.config.host,
            self.config.port,
            self.config.connect_timeout(),
            &self.ctx,
        )
        .await
        {
            Ok(conn) => Some(conn),
            Err(e) => {
                tracing::warn!("CA350 connect failed: {}", e);
                None
            }
        }
    }

    /// Run one session until it drops or shutdown. Returns false on shutdown.
    async fn serve(&mut self, mut conn: Connection) -> bool {
        let keep_going = tokio::select! {
            result = conn.closed() => {
                if let Err(e) = result {
                    tracing::error!("CA350 session failed: {}", e);
                }
                tracing::warn!("CA350 disconnected");
                true
            }
            _ = self.shutdown.wait_for(|stop| *stop) => false,
        };

        conn.stop().await;
        keep_going
    }

    fn request_pc_mode(&self, mode: u8) {
        let executor = self.executor.clone();
        tokio::spawn(async move {
            match executor.set_pc_mode(mode).await {
                Ok(outcome) => tracing::info!("Startup PC mode {}: {}", mode, outcome),
                Err(e) => tracing::warn!("Startup PC mode {} failed: {}", mode, e),
            }
        });
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(config: &ReconnectConfig) -> Self {
        Self {
            min: config.min_delay(),
            max: config.max_delay(),
            current: config.min_delay(),
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.min;
    }
}
