//! Dedicated writer task for outbound control frames.
//!
//! Command callers never touch the socket. They hand encoded frames to a
//! writer task over an mpsc channel; the task owns the write half and
//! flushes frames in order, batching whatever is ready into one vectored
//! write.
//!
//! # Architecture
//!
//! ```text
//! set_fan_level ─┐
//! set_pc_mode ───┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► TCP
//! airflow button ┘
//! ```

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{BridgeError, Result};
use crate::protocol::{build_frame, hex_dump};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 16;

/// A frame ready to be written to the device.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Command code, for logging.
    pub command: u16,
    /// Complete wire bytes, START through END.
    pub bytes: Bytes,
}

impl OutboundFrame {
    /// Encode a new outbound frame.
    pub fn new(command: u16, payload: &[u8]) -> Result<Self> {
        Ok(Self {
            command,
            bytes: Bytes::from(build_frame(command, payload)?),
        })
    }

    /// Size on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and can be shared across command callers.
#[derive(Clone)]
pub struct WriterHandle {
    /// Channel sender for frames.
    tx: mpsc::Sender<OutboundFrame>,
}

impl WriterHandle {
    /// Queue a frame for the writer task.
    ///
    /// Waits while the channel is full. Fails with `ConnectionClosed` once
    /// the writer task has exited.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| BridgeError::ConnectionClosed)
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// # Returns
///
/// A tuple of `(WriterHandle, JoinHandle)` where the JoinHandle can be used
/// to wait for the writer task to complete.
pub fn spawn_writer_task<W>(
    writer: W,
    channel_capacity: usize,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(channel_capacity);
    let task = tokio::spawn(writer_loop(rx, writer));

    (WriterHandle { tx }, task)
}

/// Main writer loop - receives frames and writes them to the socket.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(first) = rx.recv().await {
        // Collect additional ready frames (non-blocking)
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;

        for frame in &batch {
            tracing::debug!("TX {:04x} {}", frame.command, hex_dump(&frame.bytes));
        }
    }

    // Channel closed, clean shutdown
    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames using vectored I/O, continuing after short writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data not yet written.
fn remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let end = offset + frame.size();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame.bytes[start..]));
        }
        offset = end;
    }

    slices
}
