//! Transport module - the network fabric calls arrive on.
//!
//! The dispatch service only needs two things from a network: a peer count
//! and a way to accept the next connection. [`NetworkClass`] captures that;
//! three implementations are provided:
//! - [`MemoryNetwork`] - in-process `tokio::io::duplex` pairs
//! - [`TcpNetwork`] - TCP listener
//! - [`PipeNetwork`] - Unix domain socket (Unix only)

mod memory;
#[cfg(unix)]
mod pipe;
mod tcp;

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::handler::BoxFuture;

pub use memory::{MemoryConnector, MemoryNetwork};
#[cfg(unix)]
pub use pipe::{generate_pipe_path, PipeNetwork};
pub use tcp::TcpNetwork;

/// Boxed read half of a connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Identifies one connected peer for the lifetime of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// An accepted connection, split into halves.
pub struct Connection {
    peer: PeerId,
    label: String,
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl Connection {
    /// Wrap a bidirectional stream.
    pub fn new<S>(peer: PeerId, label: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_halves(peer, label, reader, writer)
    }

    /// Wrap already split halves.
    pub fn from_halves<R, W>(peer: PeerId, label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            peer,
            label: label.into(),
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    #[inline]
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Human-readable origin (address or socket path).
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("label", &self.label)
            .finish()
    }
}

/// An initialized communication fabric.
///
/// Owned by the dispatch service once handed over; dropping it releases the
/// fabric.
pub trait NetworkClass: Send + 'static {
    /// Peers connected so far.
    fn peer_count(&self) -> usize;

    /// Wait for the next peer.
    ///
    /// `Ok(None)` means no further peers will ever arrive.
    fn accept(&mut self) -> BoxFuture<'_, Result<Option<Connection>>>;
}
