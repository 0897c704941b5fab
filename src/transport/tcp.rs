//! TCP network.

use std::net::SocketAddr;

use tokio::net::{TcpListener, ToSocketAddrs};

use super::{Connection, NetworkClass, PeerId};
use crate::error::Result;
use crate::handler::BoxFuture;

/// Network accepting peers on a TCP listener.
#[derive(Debug)]
pub struct TcpNetwork {
    listener: TcpListener,
    accepted: usize,
}

impl TcpNetwork {
    /// Bind a listener. Use port 0 to pick a free port.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::debug!(addr = ?listener.local_addr().ok(), "tcp network listening");
        Ok(Self {
            listener,
            accepted: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

impl NetworkClass for TcpNetwork {
    fn peer_count(&self) -> usize {
        self.accepted
    }

    fn accept(&mut self) -> BoxFuture<'_, Result<Option<Connection>>> {
        Box::pin(async move {
            let (stream, addr) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            self.accepted += 1;

            let (reader, writer) = stream.into_split();
            Ok(Some(Connection::from_halves(
                PeerId(self.accepted as u64),
                addr.to_string(),
                reader,
                writer,
            )))
        })
    }
}
