//! Unix domain socket network.
//!
//! # Example
//!
//! ```ignore
//! use function_shipper::transport::{generate_pipe_path, PipeNetwork};
//!
//! let path = generate_pipe_path();
//! let network = PipeNetwork::bind(&path)?;
//! // hand `network` to the shipper; peers connect to `path`
//! ```

use std::path::{Path, PathBuf};

use tokio::net::UnixListener;

use super::{Connection, NetworkClass, PeerId};
use crate::error::Result;
use crate::handler::BoxFuture;

/// Generate a unique socket path for this process.
///
/// Format: `{tmp}/function-shipper-{pid}-{random}.sock`
pub fn generate_pipe_path() -> PathBuf {
    let pid = std::process::id();
    std::env::temp_dir().join(format!("function-shipper-{}-{:x}.sock", pid, rand_u64()))
}

/// Simple random u64 using system time, process ID and a counter.
fn rand_u64() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let pid = std::process::id() as u64;
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    nanos.wrapping_mul(0x517cc1b727220a95) ^ pid ^ count.rotate_left(32)
}

/// Network accepting peers on a Unix domain socket.
///
/// The socket file is removed when the network is dropped.
#[derive(Debug)]
pub struct PipeNetwork {
    listener: UnixListener,
    path: PathBuf,
    accepted: usize,
}

impl PipeNetwork {
    /// Bind to a socket path, replacing a stale socket file.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        tracing::debug!(path = %path.display(), "pipe network listening");

        Ok(Self {
            listener,
            path,
            accepted: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl NetworkClass for PipeNetwork {
    fn peer_count(&self) -> usize {
        self.accepted
    }

    fn accept(&mut self) -> BoxFuture<'_, Result<Option<Connection>>> {
        Box::pin(async move {
            let (stream, _addr) = self.listener.accept().await?;
            self.accepted += 1;

            let (reader, writer) = stream.into_split();
            Ok(Some(Connection::from_halves(
                PeerId(self.accepted as u64),
                self.path.display().to_string(),
                reader,
                writer,
            )))
        })
    }
}

impl Drop for PipeNetwork {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_pipe_path_format() {
        let path = generate_pipe_path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();

        assert!(name.starts_with("function-shipper-"));
        assert!(name.ends_with(".sock"));
        assert!(name.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_generate_pipe_path_uniqueness() {
        let paths: Vec<PathBuf> = (0..10).map(|_| generate_pipe_path()).collect();

        for (i, p1) in paths.iter().enumerate() {
            for p2 in &paths[i + 1..] {
                assert_ne!(p1, p2);
            }
        }
    }

    #[tokio::test]
    async fn test_bind_accept_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shipper.sock");

        let mut network = PipeNetwork::bind(&path).unwrap();
        let client_path = path.clone();
        let client = tokio::spawn(async move { tokio::net::UnixStream::connect(client_path).await });

        let conn = network.accept().await.unwrap().unwrap();
        assert_eq!(conn.peer(), PeerId(1));
        assert!(client.await.unwrap().is_ok());

        drop(network);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"").unwrap();

        let network = PipeNetwork::bind(&path).unwrap();
        assert_eq!(network.path(), path.as_path());
    }
}
