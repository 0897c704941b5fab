//! In-process network built on `tokio::io::duplex`.

use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::{Connection, NetworkClass, PeerId};
use crate::error::{Result, ShipperError};
use crate::handler::BoxFuture;

/// Default duplex buffer size per connection.
pub const DEFAULT_DUPLEX_BUFFER: usize = 64 * 1024;

/// Server side of an in-memory network.
#[derive(Debug)]
pub struct MemoryNetwork {
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
    accepted: usize,
}

/// Client side: opens new connections to a [`MemoryNetwork`].
///
/// Once every connector is dropped the network reports no further peers.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<DuplexStream>,
    buffer_size: usize,
}

impl MemoryNetwork {
    /// Create a network and its connector.
    pub fn new() -> (Self, MemoryConnector) {
        Self::with_buffer_size(DEFAULT_DUPLEX_BUFFER)
    }

    /// Create a network whose connections buffer `buffer_size` bytes per
    /// direction.
    pub fn with_buffer_size(buffer_size: usize) -> (Self, MemoryConnector) {
        let (tx, incoming) = mpsc::unbounded_channel();
        (
            Self {
                incoming,
                accepted: 0,
            },
            MemoryConnector { tx, buffer_size },
        )
    }
}

impl MemoryConnector {
    /// Open a connection; the peer end is queued for the network to accept.
    pub fn connect(&self) -> Result<DuplexStream> {
        let (client, server) = tokio::io::duplex(self.buffer_size);
        self.tx
            .send(server)
            .map_err(|_| ShipperError::Transport("memory network is closed".to_string()))?;
        Ok(client)
    }
}

impl NetworkClass for MemoryNetwork {
    fn peer_count(&self) -> usize {
        self.accepted
    }

    fn accept(&mut self) -> BoxFuture<'_, Result<Option<Connection>>> {
        Box::pin(async move {
            let Some(stream) = self.incoming.recv().await else {
                return Ok(None);
            };
            self.accepted += 1;
            let peer = PeerId(self.accepted as u64);
            Ok(Some(Connection::new(peer, "memory", stream)))
        })
    }
}
