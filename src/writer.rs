//! Per-connection writer task.
//!
//! Each connection owns one writer task fed through an mpsc channel, so the
//! dispatch loop and any spawned work never contend on the socket:
//!
//! ```text
//! respond() ─┐
//! respond() ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Socket
//! caller    ─┘
//! ```
//!
//! Frames that are ready together are gathered into one [`Buf`] and written
//! with `write_all_buf`, which uses vectored writes where the stream supports
//! them. Backpressure is a credit per queued frame, returned once the frame is
//! on the wire. [`WriterHandle::send_flushed`] additionally waits for that
//! write and reports its result.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;

use crate::error::{Result, ShipperError};
use crate::protocol::{payload_length, Header, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header (11 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Procedure name (empty for responses).
    pub name: Bytes,
    /// Payload bytes.
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Request frame for `procedure`.
    pub fn request(procedure: &str, request_id: u32, payload: Bytes) -> Result<Self> {
        let header = Header::request(procedure, request_id, payload_length(payload.len())?)?;
        Ok(Self {
            header: header.encode(),
            name: Bytes::copy_from_slice(procedure.as_bytes()),
            payload,
        })
    }

    /// Response frame with the given response flags.
    pub fn response(response_flags: u8, request_id: u32, payload: Bytes) -> Result<Self> {
        let header = Header::response(response_flags, request_id, payload_length(payload.len())?);
        Ok(Self {
            header: header.encode(),
            name: Bytes::new(),
            payload,
        })
    }

    /// Total size of this frame on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.name.len() + self.payload.len()
    }
}

/// Write result reported back to a [`WriterHandle::send_flushed`] caller.
type Receipt = oneshot::Sender<Result<()>>;

/// A frame on the writer queue.
#[derive(Debug)]
struct Queued {
    frame: OutboundFrame,
    receipt: Option<Receipt>,
}

/// Configuration for the writer task.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    #[serde(with = "crate::config::duration_ms", rename = "backpressure_timeout_ms")]
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
/// Cheap to clone; every call on a connection holds one. Each queued frame
/// holds one credit until the writer has put it on the wire, so at most
/// `max_pending_frames` frames are in flight per connection.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Queued>,
    credits: Arc<Semaphore>,
    max_pending: usize,
    timeout: Duration,
}

impl std::fmt::Debug for WriterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterHandle")
            .field("pending", &self.pending_count())
            .field("max_pending", &self.max_pending)
            .finish()
    }
}

impl WriterHandle {
    /// Queue a frame, waiting up to the backpressure timeout for a credit.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.enqueue(Queued {
            frame,
            receipt: None,
        })
        .await
    }

    /// Queue a frame and wait until the writer has put it on the wire.
    ///
    /// # Errors
    ///
    /// - `BackpressureTimeout` if no credit frees up, or the write does not
    ///   complete, within the backpressure timeout
    /// - `Transport` if the write failed
    /// - `ConnectionClosed` if the writer task is gone
    pub async fn send_flushed(&self, frame: OutboundFrame) -> Result<()> {
        let (receipt, written) = oneshot::channel();
        self.enqueue(Queued {
            frame,
            receipt: Some(receipt),
        })
        .await?;

        match tokio::time::timeout(self.timeout, written).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ShipperError::ConnectionClosed),
            Err(_) => Err(ShipperError::BackpressureTimeout),
        }
    }

    async fn enqueue(&self, queued: Queued) -> Result<()> {
        let permit = tokio::time::timeout(self.timeout, self.credits.acquire())
            .await
            .map_err(|_| ShipperError::BackpressureTimeout)?
            .map_err(|_| ShipperError::ConnectionClosed)?;
        permit.forget();

        self.tx.send(queued).await.map_err(|_| {
            self.credits.add_permits(1);
            ShipperError::ConnectionClosed
        })
    }

    /// Queue a frame only if a credit is free right now.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        let permit = self.credits.try_acquire().map_err(|e| match e {
            TryAcquireError::NoPermits => ShipperError::BackpressureTimeout,
            TryAcquireError::Closed => ShipperError::ConnectionClosed,
        })?;
        permit.forget();

        let queued = Queued {
            frame,
            receipt: None,
        };
        self.tx.try_send(queued).map_err(|e| {
            self.credits.add_permits(1);
            match e {
                mpsc::error::TrySendError::Full(_) => ShipperError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => ShipperError::ConnectionClosed,
            }
        })
    }

    /// True when every credit is taken.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.credits.available_permits() == 0
    }

    /// Frames queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.max_pending.saturating_sub(self.credits.available_permits())
    }

    /// True once the writer task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends cleanly once every [`WriterHandle`] is dropped and the
/// queue has drained, so awaiting the `JoinHandle` flushes the connection.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let max_pending = config.max_pending_frames.clamp(1, Semaphore::MAX_PERMITS);
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let credits = Arc::new(Semaphore::new(max_pending));

    let handle = WriterHandle {
        tx,
        credits: credits.clone(),
        max_pending,
        timeout: config.backpressure_timeout,
    };
    let task = tokio::spawn(writer_loop(rx, writer, credits));

    (handle, task)
}

/// Spawn the writer task with default configuration.
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Queued>,
    mut writer: W,
    credits: Arc<Semaphore>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = async {
        while let Some(first) = rx.recv().await {
            let mut batch = Batch::default();
            let mut receipts = Vec::new();
            let mut next = Some(first);
            while let Some(queued) = next.take() {
                receipts.extend(queued.receipt);
                batch.push(queued.frame);
                if batch.frames < MAX_BATCH_SIZE {
                    next = rx.try_recv().ok();
                }
            }

            let frames = batch.frames;
            let written = write_batch(&mut writer, batch).await;
            credits.add_permits(frames);
            if let Err(e) = written {
                tracing::warn!(error = %e, frames, "write failed, closing connection");
                for receipt in receipts {
                    let _ = receipt.send(Err(ShipperError::Transport(e.to_string())));
                }
                return Err(e);
            }
            for receipt in receipts {
                let _ = receipt.send(Ok(()));
            }
        }
        let _ = writer.shutdown().await;
        Ok(())
    }
    .await;

    // wake senders still waiting for a credit
    credits.close();
    result
}

async fn write_batch<W>(writer: &mut W, mut batch: Batch) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all_buf(&mut batch).await?;
    writer.flush().await?;
    Ok(())
}

/// Frames gathered for one write, exposed as a single [`Buf`] so vectored
/// writers get every part in one call.
#[derive(Default)]
struct Batch {
    parts: VecDeque<Bytes>,
    remaining: usize,
    frames: usize,
}

impl Batch {
    fn push(&mut self, frame: OutboundFrame) {
        let header = Bytes::copy_from_slice(&frame.header);
        for part in [header, frame.name, frame.payload] {
            if !part.is_empty() {
                self.remaining += part.len();
                self.parts.push_back(part);
            }
        }
        self.frames += 1;
    }
}

impl Buf for Batch {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn chunk(&self) -> &[u8] {
        self.parts.front().map_or(&[][..], |part| part.as_ref())
    }

    fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        let mut n = 0;
        for (slot, part) in dst.iter_mut().zip(&self.parts) {
            *slot = IoSlice::new(part);
            n += 1;
        }
        n
    }

    fn advance(&mut self, mut cnt: usize) {
        self.remaining = self.remaining.saturating_sub(cnt);
        while cnt > 0 {
            let Some(front) = self.parts.front_mut() else {
                break;
            };
            if cnt < front.len() {
                front.advance(cnt);
                break;
            }
            cnt -= front.len();
            self.parts.pop_front();
        }
    }
}
