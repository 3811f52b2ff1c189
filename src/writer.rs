//! Dedicated writer task for outgoing frames.
//!
//! All submitters share one socket write half through an mpsc channel. The
//! writer task drains the channel and batches whatever is ready into a single
//! vectored write, so submitters only contend on the channel.
//!
//! # Architecture
//!
//! ```text
//! Request 1 ─┐
//! Request 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Socket
//! Request N ─┘
//! ```

use std::io::IoSlice;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backpressure::{BackpressureController, BackpressureGuard};
use crate::error::{Error, Result};
use crate::protocol::{encode_length, Header, LENGTH_PREFIX_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Length prefix followed by the encoded header map.
    pub head: Vec<u8>,
    /// Body bytes (empty for body-less requests).
    pub body: Bytes,
}

impl OutboundFrame {
    /// Encode a header and attach the body.
    pub fn new(header: &Header, body: Bytes) -> Result<Self> {
        let mut head = Vec::with_capacity(LENGTH_PREFIX_SIZE + 24);
        head.extend_from_slice(&[0u8; LENGTH_PREFIX_SIZE]);
        header.encode_into(&mut head)?;

        let len = head.len() - LENGTH_PREFIX_SIZE + body.len();
        let len = u32::try_from(len)
            .map_err(|_| Error::Protocol(format!("Packet of {} bytes is too large", len)))?;
        head[..LENGTH_PREFIX_SIZE].copy_from_slice(&encode_length(len));

        Ok(Self { head, body })
    }

    /// Total size of this frame on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.head.len() + self.body.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    backpressure: BackpressureController,
}

impl WriterHandle {
    /// Send a frame to the writer task.
    ///
    /// Waits while backpressure is active, up to the configured timeout.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.backpressure.reserve().await?;
        let guard = BackpressureGuard::new(self.backpressure.clone());

        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::Connectivity("Writer task has stopped".to_string()))?;

        guard.disarm();
        Ok(())
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.backpressure.is_active()
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.backpressure.pending_count()
    }

    /// Whether the writer task is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends with `Ok(())` once every handle is dropped, or with the
/// first I/O error.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let backpressure =
        BackpressureController::with_timeout(config.max_pending_frames, config.backpressure_timeout);

    let handle = WriterHandle {
        tx,
        backpressure: backpressure.clone(),
    };
    let task = tokio::spawn(writer_loop(rx, writer, backpressure));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    backpressure: BackpressureController,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(first) = rx.recv().await else {
            let _ = writer.shutdown().await;
            return Ok(());
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let result = write_batch(&mut writer, &batch).await;
        backpressure.release_many(batch_size);

        if let Err(e) = result {
            tracing::error!("Writer task failed after {} frames: {}", batch_size, e);
            return Err(e);
        }
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data after the first `skip_bytes` bytes.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [&frame.head[..], &frame.body[..]] {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}
