//! Forwarding side: ship a call to a remote [`Shipper`](crate::Shipper) and
//! wait for its response.
//!
//! A [`Caller`] owns one connection. Requests go out through the same writer
//! task the server uses; a reader task matches responses to waiting calls by
//! request id, so several calls may be in flight at once.
//!
//! # Example
//!
//! ```ignore
//! let caller = Caller::connect_tcp("127.0.0.1:7000", ShipperConfig::default()).await?;
//!
//! let mut args = OpenIn { path: "/tmp/x".into(), handle: Handle { cookie: 42 } };
//! let out: OpenOut = caller.call("bla_open", &mut args, Duration::from_secs(5)).await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::ShipperConfig;
use crate::error::{Result, ShipperError};
use crate::proc::{decode_value, encode_with, OutputBuffer, Proc, ProcField};
use crate::protocol::{Frame, FrameBuffer};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

type PendingMap = HashMap<u32, oneshot::Sender<Frame>>;

/// Calls waiting for their response, keyed by request id.
///
/// `None` once the connection has ended; no new waiter is accepted after that.
struct Pending {
    calls: Mutex<Option<PendingMap>>,
}

impl Pending {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Some(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<PendingMap>> {
        // the map stays consistent even if a holder panicked
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, request_id: u32) -> Result<oneshot::Receiver<Frame>> {
        let mut calls = self.lock();
        let map = calls.as_mut().ok_or(ShipperError::ConnectionClosed)?;
        let (tx, rx) = oneshot::channel();
        map.insert(request_id, tx);
        Ok(rx)
    }

    fn remove(&self, request_id: u32) -> Option<oneshot::Sender<Frame>> {
        self.lock().as_mut().and_then(|map| map.remove(&request_id))
    }

    fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, HashMap::len)
    }

    /// Drop every waiter and refuse new ones; returns how many were waiting.
    fn close(&self) -> usize {
        self.lock().take().map_or(0, |map| map.len())
    }
}

/// Client connection to a dispatch service.
pub struct Caller {
    config: ShipperConfig,
    writer: Option<WriterHandle>,
    writer_task: Option<JoinHandle<Result<()>>>,
    reader_task: JoinHandle<()>,
    pending: Arc<Pending>,
    next_id: AtomicU32,
}

impl Caller {
    /// Wrap an established stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S>(stream: S, config: ShipperConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_halves(reader, writer, config)
    }

    /// Wrap already split halves.
    pub fn from_halves<R, W>(reader: R, writer: W, config: ShipperConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (writer, writer_task) = spawn_writer_task(writer, config.writer.clone());
        let pending = Arc::new(Pending::new());
        let reader_task = tokio::spawn(response_loop(
            reader,
            pending.clone(),
            config.max_payload_size,
        ));

        Self {
            config,
            writer: Some(writer),
            writer_task: Some(writer_task),
            reader_task,
            pending,
            next_id: AtomicU32::new(1),
        }
    }

    /// Connect to a shipper listening on TCP.
    pub async fn connect_tcp<A>(addr: A, config: ShipperConfig) -> Result<Self>
    where
        A: tokio::net::ToSocketAddrs,
    {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self::from_halves(reader, writer, config))
    }

    /// Connect to a shipper listening on a Unix domain socket.
    #[cfg(unix)]
    pub async fn connect_pipe(
        path: impl AsRef<std::path::Path>,
        config: ShipperConfig,
    ) -> Result<Self> {
        let stream = tokio::net::UnixStream::connect(path.as_ref()).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self::from_halves(reader, writer, config))
    }

    /// Calls still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn config(&self) -> &ShipperConfig {
        &self.config
    }

    /// Ship `input` to `procedure` and decode the typed response.
    ///
    /// # Errors
    ///
    /// - `Timeout` if no response arrived within `timeout`
    /// - `Remote` with the peer's message for an error response
    /// - `ConnectionClosed` if the connection ended first
    /// - decode errors if the response does not match `Out`
    pub async fn call<In, Out>(
        &self,
        procedure: &str,
        input: &mut In,
        timeout: Duration,
    ) -> Result<Out>
    where
        In: ProcField,
        Out: ProcField + Default,
    {
        let proc = Proc::encode(OutputBuffer::with_capacity(self.config.inline_buffer_size))
            .with_max_extra(self.config.max_extra_size);
        let (payload, spilled) = encode_with(input, proc)?.into_payload();
        if spilled {
            tracing::trace!(procedure, size = payload.len(), "request spilled to extra buffer");
        }

        let frame = self.call_raw(procedure, payload, timeout).await?;
        decode_value(frame.payload)
    }

    /// Ship an already encoded payload and return the success response frame.
    pub async fn call_raw(&self, procedure: &str, payload: Bytes, timeout: Duration) -> Result<Frame> {
        let writer = self.writer.as_ref().ok_or(ShipperError::ShuttingDown)?;
        let request_id = self.next_request_id();
        let request = OutboundFrame::request(procedure, request_id, payload)?;

        let response = self.pending.insert(request_id)?;
        if let Err(e) = writer.send(request).await {
            self.pending.remove(request_id);
            return Err(e);
        }

        let frame = match tokio::time::timeout(timeout, response).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => return Err(ShipperError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(request_id);
                tracing::debug!(procedure, request_id, "call timed out");
                return Err(ShipperError::Timeout);
            }
        };

        if frame.is_error() {
            let message: String = decode_value(frame.payload)?;
            return Err(ShipperError::Remote(message));
        }
        Ok(frame)
    }

    /// Flush outstanding requests and close the connection.
    pub async fn close(mut self) -> Result<()> {
        self.writer.take();
        let flushed = match self.writer_task.take() {
            Some(task) => task
                .await
                .map_err(|e| ShipperError::Transport(format!("writer task failed: {}", e)))?,
            None => Ok(()),
        };
        self.reader_task.abort();
        self.pending.close();
        flushed
    }

    fn next_request_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Drop for Caller {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl std::fmt::Debug for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caller")
            .field("pending", &self.pending_count())
            .field("closed", &self.writer.is_none())
            .finish()
    }
}

async fn response_loop<R>(mut reader: R, pending: Arc<Pending>, max_payload_size: u32)
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_payload(max_payload_size);
    let mut buf = vec![0u8; 64 * 1024];

    let ended = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(ShipperError::from(e)),
        };

        let frames = match frame_buffer.push(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => break Err(e),
        };

        for frame in frames {
            if !frame.is_response() {
                tracing::warn!(request_id = frame.request_id(), "ignoring request frame on caller");
                continue;
            }
            match pending.remove(frame.request_id()) {
                Some(waiter) => {
                    let _ = waiter.send(frame);
                }
                None => tracing::debug!(
                    request_id = frame.request_id(),
                    "response for unknown or expired call"
                ),
            }
        }
    };

    let abandoned = pending.close();
    match ended {
        Ok(()) => tracing::debug!(abandoned, "connection closed by shipper"),
        Err(e) => tracing::warn!(abandoned, kind = e.kind(), error = %e, "caller connection failed"),
    }
}
