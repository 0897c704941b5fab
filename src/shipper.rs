//! Dispatch service: builder and processing loop.
//!
//! The [`ShipperBuilder`] collects handlers and settings; [`Shipper`] owns a
//! network and services calls one at a time:
//! 1. An acceptor task takes peers from the [`NetworkClass`]
//! 2. Each peer gets a reader task (frames → call queue) and a writer task
//! 3. [`Shipper::process`] takes one call, resolves its handler, runs it and
//!    makes sure exactly one response goes back
//!
//! # Example
//!
//! ```ignore
//! use function_shipper::{Shipper, TcpNetwork};
//!
//! let network = TcpNetwork::bind("127.0.0.1:7000").await?;
//! let mut shipper = Shipper::builder()
//!     .handle_typed("bla_open", |args: OpenIn| async move {
//!         Ok(OpenOut { event_id: 232, ret: 0 })
//!     })
//!     .start(network)?;
//!
//! for _ in 0..3 {
//!     shipper.process(Duration::from_secs(10)).await?;
//! }
//! shipper.finalize().await?;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::config::ShipperConfig;
use crate::error::{Result, ShipperError};
use crate::handler::{CallHandle, CallState, Handler, HandlerFn, HandlerRegistry};
use crate::proc::ProcField;
use crate::protocol::{Frame, FrameBuffer};
use crate::transport::{BoxedReader, Connection, NetworkClass, PeerId};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Size of each socket read.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Builder for configuring and starting a [`Shipper`].
///
/// Registration errors are held until [`start`](Self::start), which returns
/// the first one before any call is accepted.
pub struct ShipperBuilder {
    registry: HandlerRegistry,
    config: ShipperConfig,
    error: Option<ShipperError>,
}

impl ShipperBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            config: ShipperConfig::default(),
            error: None,
        }
    }

    fn record(mut self, result: Result<()>) -> Self {
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Register a handler implementation.
    pub fn handler<H: Handler>(mut self, procedure: &str, handler: H) -> Self {
        let result = self.registry.register(procedure, handler);
        self.record(result)
    }

    /// Register a plain function handler.
    pub fn handle_fn(mut self, procedure: &str, f: HandlerFn) -> Self {
        let result = self.registry.register_fn(procedure, f);
        self.record(result)
    }

    /// Register an async function from typed input to typed output.
    pub fn handle_typed<F, In, Out, Fut>(mut self, procedure: &str, f: F) -> Self
    where
        F: Fn(In) -> Fut + Send + Sync + 'static,
        In: ProcField + Default + Clone + Send + 'static,
        Out: ProcField + Send + 'static,
        Fut: Future<Output = Result<Out>> + Send + 'static,
    {
        let result = self.registry.register_typed(procedure, f);
        self.record(result)
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ShipperConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the inline output buffer size.
    ///
    /// Default: 4096
    pub fn inline_buffer_size(mut self, size: usize) -> Self {
        self.config.inline_buffer_size = size;
        self
    }

    /// Cap extra-buffer growth.
    ///
    /// Default: 1 GB
    pub fn max_extra_size(mut self, size: usize) -> Self {
        self.config.max_extra_size = size;
        self
    }

    /// Set the largest accepted incoming payload.
    ///
    /// Default: 1 GB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Set how many received calls may wait for `process`.
    ///
    /// Default: 1024
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self
    }

    /// Start servicing `network`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<N: NetworkClass>(self, network: N) -> Result<Shipper> {
        if let Some(e) = self.error {
            return Err(e);
        }
        Shipper::init(network, self.registry, self.config)
    }
}

impl Default for ShipperBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// How a serviced call ended.
#[derive(Debug)]
pub enum CallStatus {
    /// A success response was sent.
    Responded,
    /// The call failed; an error response was attempted.
    Failed(ShipperError),
}

/// Result of one [`Shipper::process`] iteration.
#[derive(Debug)]
pub struct CallOutcome {
    pub peer: PeerId,
    pub request_id: u32,
    pub procedure: String,
    pub status: CallStatus,
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, CallStatus::Responded)
    }
}

/// Counters kept across `process` calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeStats {
    /// Calls taken off the queue.
    pub calls: u64,
    pub responded: u64,
    pub failed: u64,
    /// Idle windows that elapsed with no call.
    pub timeouts: u64,
}

impl ServeStats {
    fn record(&mut self, status: &CallStatus) {
        self.calls += 1;
        match status {
            CallStatus::Responded => self.responded += 1,
            CallStatus::Failed(_) => self.failed += 1,
        }
    }
}

/// Signals a running shipper to stop accepting calls.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A call received by a reader task, waiting for `process`.
struct IncomingCall {
    peer: PeerId,
    frame: Frame,
    writer: WriterHandle,
}

/// A running dispatch service.
pub struct Shipper {
    registry: Arc<HandlerRegistry>,
    config: ShipperConfig,
    calls: mpsc::Receiver<IncomingCall>,
    peers: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    shutdown: Arc<watch::Sender<bool>>,
    acceptor: Option<JoinHandle<()>>,
    stats: ServeStats,
}

impl Shipper {
    /// Create a new shipper builder.
    pub fn builder() -> ShipperBuilder {
        ShipperBuilder::new()
    }

    /// Start servicing `network` with a prepared registry.
    ///
    /// The registry is frozen from here on. Must be called from within a
    /// tokio runtime.
    pub fn init<N: NetworkClass>(
        network: N,
        registry: HandlerRegistry,
        config: ShipperConfig,
    ) -> Result<Self> {
        config.validate()?;
        if registry.is_empty() {
            tracing::warn!("starting shipper with no registered procedures");
        }

        let (calls_tx, calls) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let peers = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));

        let acceptor = tokio::spawn(accept_loop(
            network,
            AcceptContext {
                calls: calls_tx,
                shutdown: shutdown_rx,
                peers: peers.clone(),
                active: active.clone(),
                writer_config: config.writer.clone(),
                max_payload_size: config.max_payload_size,
            },
        ));

        tracing::info!(procedures = ?registry.procedures(), "shipper started");

        Ok(Self {
            registry: Arc::new(registry),
            config,
            calls,
            peers,
            active,
            shutdown: Arc::new(shutdown_tx),
            acceptor: Some(acceptor),
            stats: ServeStats::default(),
        })
    }

    /// Peers accepted so far.
    pub fn peer_count(&self) -> usize {
        self.peers.load(Ordering::Acquire)
    }

    /// Connections whose tasks are still running.
    pub fn active_peers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ShipperConfig {
        &self.config
    }

    pub fn stats(&self) -> ServeStats {
        self.stats
    }

    /// Handle that stops [`serve`](Self::serve) and the acceptor.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown.clone(),
        }
    }

    /// Service exactly one call.
    ///
    /// # Errors
    ///
    /// - `Timeout` if no call arrived within `idle_timeout` (not a failure)
    /// - `ConnectionClosed` once the network has no peers left and none will
    ///   arrive
    /// - transport errors when the response could not be delivered
    ///
    /// Per-call failures (unknown procedure, truncated input, handler
    /// errors) are reported in the returned [`CallOutcome`].
    pub async fn process(&mut self, idle_timeout: Duration) -> Result<CallOutcome> {
        let incoming = self.next_call(idle_timeout).await?;
        let outcome = self.handle(incoming).await;
        if let CallStatus::Failed(e) = &outcome.status {
            if e.is_transport() {
                return Err(ShipperError::Transport(format!(
                    "response to {} for {} not delivered: {}",
                    outcome.peer, outcome.procedure, e
                )));
            }
        }
        Ok(outcome)
    }

    /// Service calls until `keep_going` returns false or shutdown is
    /// signalled.
    ///
    /// The shutdown signal is only observed between calls, so a call that
    /// has been taken off the queue always completes.
    pub async fn serve<P>(&mut self, idle_timeout: Duration, mut keep_going: P) -> Result<ServeStats>
    where
        P: FnMut(&ServeStats) -> bool,
    {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow_and_update() || !keep_going(&self.stats) {
                break;
            }

            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.next_call(idle_timeout) => next,
            };

            match next {
                Ok(incoming) => {
                    let outcome = self.handle(incoming).await;
                    if let CallStatus::Failed(e) = &outcome.status {
                        if e.is_transport() {
                            tracing::warn!(peer = %outcome.peer, error = %e, "response not delivered");
                        }
                    }
                }
                Err(ShipperError::Timeout) => continue,
                Err(ShipperError::ConnectionClosed) => {
                    tracing::info!("no peers left, stopping");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(self.stats)
    }

    /// Stop accepting, drop queued calls, flush writers and release the
    /// network.
    pub async fn finalize(mut self) -> Result<()> {
        self.shutdown.send_replace(true);

        // Readers stop on the shutdown signal; whatever they queued is dropped
        self.calls.close();
        let mut dropped = 0usize;
        while let Ok(incoming) = self.calls.try_recv() {
            dropped += 1;
            tracing::warn!(
                peer = %incoming.peer,
                request_id = incoming.frame.request_id(),
                procedure = incoming.frame.procedure().unwrap_or("<invalid>"),
                "dropping call received before finalize"
            );
        }

        // The acceptor joins every connection, each writer bounded by the
        // backpressure timeout
        if let Some(acceptor) = self.acceptor.take() {
            if let Err(e) = acceptor.await {
                tracing::warn!(error = %e, "acceptor task failed");
            }
        }

        tracing::info!(
            calls = self.stats.calls,
            responded = self.stats.responded,
            failed = self.stats.failed,
            dropped,
            "shipper finalized"
        );
        Ok(())
    }

    async fn next_call(&mut self, idle_timeout: Duration) -> Result<IncomingCall> {
        match tokio::time::timeout(idle_timeout, self.calls.recv()).await {
            Ok(Some(incoming)) => Ok(incoming),
            Ok(None) => Err(ShipperError::ConnectionClosed),
            Err(_) => {
                self.stats.timeouts += 1;
                Err(ShipperError::Timeout)
            }
        }
    }

    async fn handle(&mut self, incoming: IncomingCall) -> CallOutcome {
        let IncomingCall {
            peer,
            frame,
            writer,
        } = incoming;
        let request_id = frame.request_id();
        let procedure = frame.procedure().map(str::to_string);
        let name = match &procedure {
            Ok(name) => name.clone(),
            Err(_) => String::from_utf8_lossy(&frame.name).into_owned(),
        };

        let mut call = CallHandle::new(
            peer,
            request_id,
            name.clone(),
            frame.payload,
            self.config.inline_buffer_size,
            self.config.max_extra_size,
            writer,
        );

        let status = match procedure {
            Ok(_) => self.dispatch(&mut call).await,
            Err(e) => fail(&mut call, e).await,
        };
        self.stats.record(&status);

        CallOutcome {
            peer,
            request_id,
            procedure: name,
            status,
        }
    }

    async fn dispatch(&self, call: &mut CallHandle) -> CallStatus {
        let handler = match self.registry.resolve(call.procedure()) {
            Ok(handler) => handler,
            Err(e) => return fail(call, e).await,
        };

        tracing::debug!(
            peer = %call.peer(),
            request_id = call.request_id(),
            procedure = call.procedure(),
            "dispatching call"
        );

        let result = handler.call(call).await;

        match (result, call.state()) {
            (Ok(()), CallState::Responded) => CallStatus::Responded,
            (Ok(()), CallState::Failed) => CallStatus::Failed(ShipperError::Remote(
                call.failure().unwrap_or_default().to_string(),
            )),
            (Ok(()), _) => {
                let e = ShipperError::InvalidState("handler returned without responding".to_string());
                fail(call, e).await
            }
            (Err(e), CallState::Responded) => {
                tracing::warn!(
                    procedure = call.procedure(),
                    error = %e,
                    "handler failed after responding"
                );
                CallStatus::Responded
            }
            (Err(e), CallState::Failed) => CallStatus::Failed(e),
            (Err(e), _) => fail(call, e).await,
        }
    }
}

impl Drop for Shipper {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for Shipper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shipper")
            .field("registry", &self.registry)
            .field("peers", &self.peer_count())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Fail a call: log it and send an error response.
async fn fail(call: &mut CallHandle, error: ShipperError) -> CallStatus {
    tracing::warn!(
        peer = %call.peer(),
        request_id = call.request_id(),
        procedure = call.procedure(),
        kind = error.kind(),
        error = %error,
        "call failed"
    );

    if let Err(e) = call.respond_error(&error.to_string()).await {
        tracing::warn!(peer = %call.peer(), error = %e, "could not send error response");
        if !error.is_transport() {
            return CallStatus::Failed(e);
        }
    }
    CallStatus::Failed(error)
}

/// Everything the acceptor hands to each connection.
struct AcceptContext {
    calls: mpsc::Sender<IncomingCall>,
    shutdown: watch::Receiver<bool>,
    peers: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    writer_config: WriterConfig,
    max_payload_size: u32,
}

async fn accept_loop<N: NetworkClass>(mut network: N, mut ctx: AcceptContext) {
    let mut connections = JoinSet::new();

    loop {
        if *ctx.shutdown.borrow_and_update() {
            break;
        }

        tokio::select! {
            _ = ctx.shutdown.changed() => break,
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                reap(joined);
            }
            accepted = network.accept() => match accepted {
                Ok(Some(conn)) => {
                    ctx.peers.store(network.peer_count(), Ordering::Release);
                    start_connection(conn, &ctx, &mut connections);
                }
                Ok(None) => {
                    tracing::debug!("network has no more peers");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed, no further peers");
                    break;
                }
            },
        }
    }

    // release the fabric and the acceptor's queue sender, then wait out the
    // remaining connections
    drop(network);
    drop(ctx);
    while let Some(joined) = connections.join_next().await {
        reap(joined);
    }
}

fn reap(joined: std::result::Result<PeerId, JoinError>) {
    match joined {
        Ok(peer) => tracing::debug!(peer = %peer, "connection finished"),
        Err(e) => tracing::warn!(error = %e, "connection task failed"),
    }
}

fn start_connection(conn: Connection, ctx: &AcceptContext, connections: &mut JoinSet<PeerId>) {
    let peer = conn.peer();
    tracing::info!(peer = %peer, origin = conn.label(), "peer connected");

    let (reader, writer) = conn.into_split();
    let (writer_handle, writer_task) = spawn_writer_task(writer, ctx.writer_config.clone());
    let flush_timeout = ctx.writer_config.backpressure_timeout;
    let calls = ctx.calls.clone();
    let shutdown = ctx.shutdown.clone();
    let max_payload_size = ctx.max_payload_size;
    let active = ctx.active.clone();
    active.fetch_add(1, Ordering::AcqRel);

    connections.spawn(async move {
        read_loop(peer, reader, writer_handle, calls, shutdown.clone(), max_payload_size).await;
        join_writer(peer, writer_task, shutdown, flush_timeout).await;
        active.fetch_sub(1, Ordering::AcqRel);
        peer
    });
}

/// Wait for a connection's writer to drain its queue.
///
/// Unbounded while the shipper runs, since queued calls still hold the
/// writer; after shutdown the flush gets `flush_timeout` before the task is
/// aborted.
async fn join_writer(
    peer: PeerId,
    mut task: JoinHandle<Result<()>>,
    mut shutdown: watch::Receiver<bool>,
    flush_timeout: Duration,
) {
    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = stopped(&mut shutdown) => {
            match tokio::time::timeout(flush_timeout, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!(peer = %peer, "writer did not flush in time");
                    task.abort();
                    return;
                }
            }
        }
    };

    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(peer = %peer, error = %e, "writer closed with error"),
        Err(e) => tracing::warn!(peer = %peer, error = %e, "writer task failed"),
    }
}

/// Resolves once shutdown is signalled or the shipper is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Read frames from one peer and queue them as calls.
async fn read_loop(
    peer: PeerId,
    reader: BoxedReader,
    writer: WriterHandle,
    calls: mpsc::Sender<IncomingCall>,
    shutdown: watch::Receiver<bool>,
    max_payload_size: u32,
) {
    match read_frames(peer, reader, writer, calls, shutdown, max_payload_size).await {
        Ok(()) => tracing::debug!(peer = %peer, "peer disconnected"),
        Err(e) => tracing::warn!(peer = %peer, kind = e.kind(), error = %e, "connection dropped"),
    }
}

async fn read_frames(
    peer: PeerId,
    mut reader: BoxedReader,
    writer: WriterHandle,
    calls: mpsc::Sender<IncomingCall>,
    mut shutdown: watch::Receiver<bool>,
    max_payload_size: u32,
) -> Result<()> {
    let mut frame_buffer = FrameBuffer::with_max_payload(max_payload_size);
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        if *shutdown.borrow_and_update() {
            return Ok(());
        }

        let n = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            read = reader.read(&mut buf) => match read? {
                0 => return Ok(()),
                n => n,
            },
        };

        for frame in frame_buffer.push(&buf[..n])? {
            if frame.is_response() {
                tracing::warn!(peer = %peer, request_id = frame.request_id(), "ignoring response frame");
                continue;
            }

            let incoming = IncomingCall {
                peer,
                frame,
                writer: writer.clone(),
            };
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                sent = calls.send(incoming) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
