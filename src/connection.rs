//! One device session: TCP socket, receive loop and writer task.
//!
//! Lifecycle: `Disconnected → Connecting → Connected → Disconnected`.
//! [`Connection::open`] connects and starts both tasks. The receive loop
//! feeds every chunk into a fresh [`FrameBuffer`], applies valid frames to
//! the shared state and broadcasts the telemetry that changed. The session
//! ends on a zero-length read, a socket error on either half or
//! [`Connection::stop`]; it is then `Disconnected` for good. Reconnecting
//! means opening a new session.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinError, JoinHandle};

use crate::error::{BridgeError, Result};
use crate::protocol::FrameBuffer;
use crate::state::SharedState;
use crate::telemetry::Telemetry;
use crate::transport;
use crate::writer::{spawn_writer_task, WriterHandle, DEFAULT_CHANNEL_CAPACITY};

/// Socket read size.
const READ_BUFFER_SIZE: usize = 256;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        })
    }
}

/// Everything a session shares with the rest of the bridge.
#[derive(Clone)]
pub struct SessionContext {
    pub state: SharedState,
    pub telemetry: broadcast::Sender<Telemetry>,
    pub status: Arc<watch::Sender<ConnectionState>>,
    /// Writer of the live session, `None` while disconnected.
    pub writer: Arc<watch::Sender<Option<WriterHandle>>>,
    /// Command codes seen across all sessions.
    pub seen_commands: Arc<Mutex<BTreeSet<u16>>>,
}

impl SessionContext {
    pub fn new(telemetry_capacity: usize) -> Self {
        let (telemetry, _) = broadcast::channel(telemetry_capacity);
        let (status, _) = watch::channel(ConnectionState::Disconnected);
        let (writer, _) = watch::channel(None);
        Self {
            state: SharedState::new(),
            telemetry,
            status: Arc::new(status),
            writer: Arc::new(writer),
            seen_commands: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    fn set_status(&self, status: ConnectionState) {
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }
}

/// Which session task finished first.
enum Ended {
    Reader(Result<()>),
    Writer(Result<()>),
}

/// A live device session.
pub struct Connection {
    peer: SocketAddr,
    writer: WriterHandle,
    stop_tx: watch::Sender<bool>,
    read_task: Option<JoinHandle<Result<()>>>,
    writer_task: Option<JoinHandle<Result<()>>>,
}

impl Connection {
    /// Connect to the gateway and start the receive loop and writer task.
    pub async fn open(
        host: &str,
        port: u16,
        timeout: Duration,
        ctx: &SessionContext,
    ) -> Result<Self> {
        ctx.set_status(ConnectionState::Connecting);

        let stream = match transport::connect(host, port, timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                ctx.set_status(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let peer = stream.peer_addr();
        let (reader, writer) = stream.into_split();
        tracing::info!("Connected to CA350 at {}", peer);

        Ok(Self::start(peer, reader, writer, ctx))
    }

    /// Start both session tasks on an already connected stream.
    ///
    /// The writer is published before the state turns `Connected`, and
    /// withdrawn before it turns `Disconnected`.
    fn start<R, W>(peer: SocketAddr, reader: R, writer: W, ctx: &SessionContext) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer, writer_task) = spawn_writer_task(writer, DEFAULT_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);

        ctx.writer.send_replace(Some(writer.clone()));
        ctx.set_status(ConnectionState::Connected);

        let session = ctx.clone();
        let read_task = tokio::spawn(async move {
            let result = read_loop(reader, &session, stop_rx).await;
            match &result {
                Ok(()) => tracing::info!("Receive loop ended"),
                Err(e) => tracing::error!("RX error: {}", e),
            }
            session.writer.send_replace(None);
            session.set_status(ConnectionState::Disconnected);
            result
        });

        Self {
            peer,
            writer,
            stop_tx,
            read_task: Some(read_task),
            writer_task: Some(writer_task),
        }
    }

    /// Address of the gateway.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Handle for queueing outbound frames on this session.
    pub fn writer(&self) -> WriterHandle {
        self.writer.clone()
    }

    /// Wait until the session ends.
    ///
    /// The session ends when the receive loop ends or the writer task fails;
    /// a failed writer stops the receive loop. Returns `Ok` for a clean close
    /// or stop and `Err` for a socket error on either side. Later calls
    /// return `Ok` immediately.
    pub async fn closed(&mut self) -> Result<()> {
        let ended = match (self.read_task.as_mut(), self.writer_task.as_mut()) {
            (None, _) => return Ok(()),
            (Some(read_task), None) => Ended::Reader(task_result(read_task.await, "Receive")),
            (Some(read_task), Some(writer_task)) => tokio::select! {
                joined = read_task => Ended::Reader(task_result(joined, "Receive")),
                joined = writer_task => Ended::Writer(task_result(joined, "Writer")),
            },
        };

        match ended {
            Ended::Reader(result) => {
                self.read_task = None;
                result
            }
            Ended::Writer(result) => {
                self.writer_task = None;
                if let Err(e) = &result {
                    tracing::error!("TX error: {}", e);
                }
                let _ = self.stop_tx.send(true);
                let read_result = match self.read_task.take() {
                    Some(task) => task_result(task.await, "Receive"),
                    None => Ok(()),
                };
                result.and(read_result)
            }
        }
    }

    /// Stop the session: end the receive loop and close the socket.
    pub async fn stop(mut self) {
        tracing::info!("Stopping CA350 connection...");
        let _ = self.stop_tx.send(true);
        // Aborting drops the write half, which closes the socket for writes
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
        if let Err(e) = self.closed().await {
            tracing::warn!("Connection shutdown error: {}", e);
        }
    }
}

fn task_result(joined: std::result::Result<Result<()>, JoinError>, task: &str) -> Result<()> {
    joined.unwrap_or_else(|e| Err(BridgeError::Protocol(format!("{} task failed: {}", task, e))))
}

/// Receive loop: socket → frame buffer → state → telemetry.
async fn read_loop<R>(
    mut reader: R,
    ctx: &SessionContext,
    mut stop: watch::Receiver<bool>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut parser = FrameBuffer::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let result = loop {
        let n = tokio::select! {
            _ = stop.wait_for(|stop| *stop) => break Ok(()),
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::warn!("CA350 closed the connection");
                    break Ok(());
                }
                Ok(n) => n,
                Err(e) => break Err(BridgeError::Io(e)),
            },
        };

        for frame in parser.push(&buf[..n]) {
            for telemetry in ctx.state.apply_frame(&frame) {
                // No subscribers is fine
                let _ = ctx.telemetry.send(telemetry);
            }
        }
        // Checksum failures count as seen too
        ctx.seen_commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(parser.seen_commands().iter().copied());
    };

    let stats = parser.stats();
    tracing::debug!(
        "Parser stats: {} frames, {} checksum errors, {} resyncs, {} bytes discarded",
        stats.frames,
        stats.checksum_errors,
        stats.resyncs,
        stats.discarded
    );
    result
}
