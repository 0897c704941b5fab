//! Shipper configuration.
//!
//! Every field has a default, so a JSON file only needs the keys it changes:
//!
//! ```
//! use function_shipper::config::ShipperConfig;
//!
//! let config = ShipperConfig::from_json_str(r#"{
//!     "inline_buffer_size": 256,
//!     "writer": { "backpressure_timeout_ms": 500 }
//! }"#).unwrap();
//!
//! assert_eq!(config.inline_buffer_size, 256);
//! assert_eq!(config.queue_capacity, 1024);
//! assert_eq!(config.writer.backpressure_timeout.as_millis(), 500);
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, ShipperError};
use crate::proc::DEFAULT_MAX_EXTRA_SIZE;
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::writer::WriterConfig;

/// Default inline output buffer size handed to each call.
pub const DEFAULT_INLINE_BUFFER_SIZE: usize = 4096;

/// Default number of received calls that may wait for `process`.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Configuration for a [`Shipper`](crate::Shipper) or [`Caller`](crate::Caller).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShipperConfig {
    /// Inline output capacity; larger encodings spill into an extra buffer.
    pub inline_buffer_size: usize,
    /// Cap on extra-buffer growth.
    pub max_extra_size: usize,
    /// Largest payload accepted in an incoming frame.
    pub max_payload_size: u32,
    /// Received calls buffered ahead of `process`.
    pub queue_capacity: usize,
    /// Per-connection writer settings.
    pub writer: WriterConfig,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            inline_buffer_size: DEFAULT_INLINE_BUFFER_SIZE,
            max_extra_size: DEFAULT_MAX_EXTRA_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            writer: WriterConfig::default(),
        }
    }
}

impl ShipperConfig {
    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Reject settings the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(ShipperError::InvalidArgument(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.writer.channel_capacity == 0 {
            return Err(ShipperError::InvalidArgument(
                "writer.channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde adapter for `Duration` fields written as milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
