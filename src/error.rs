//! Error types for the function shipper.

use thiserror::Error;

/// Main error type for all shipper operations.
#[derive(Debug, Error)]
pub enum ShipperError {
    /// I/O error during socket/pipe operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level failure (peer unreachable, accept failed, ...).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Decode tried to read past the end of the supplied buffer.
    #[error("Truncated input: needed {needed} bytes, {available} available")]
    Truncation { needed: usize, available: usize },

    /// Bytes were present but do not form a valid value.
    #[error("Malformed input: {0}")]
    Malformed(String),

    /// A procedure name was registered twice.
    #[error("Procedure already registered: {0}")]
    DuplicateRegistration(String),

    /// No handler registered under the given name.
    #[error("Unknown procedure: {0}")]
    UnknownProcedure(String),

    /// Caller supplied an argument the operation cannot accept.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Extra-buffer growth failed or exceeded its limit.
    #[error("Allocation of {requested} bytes failed (limit {limit})")]
    Allocation { requested: usize, limit: usize },

    /// No call arrived within the idle window.
    #[error("Timed out waiting for a call")]
    Timeout,

    /// Operation not allowed in the current call or proc state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Protocol error (invalid frame, wrong flags, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote side answered with an error response.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// The shipper is finalizing and no longer accepts calls.
    #[error("Shutting down")]
    ShuttingDown,

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// JSON error (configuration files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ShipperError {
    /// True for the idle-window outcome, which is not a failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ShipperError::Timeout)
    }

    /// True for errors scoped to a single call; the dispatch loop keeps
    /// running after them.
    pub fn is_per_call(&self) -> bool {
        matches!(
            self,
            ShipperError::Truncation { .. }
                | ShipperError::Malformed(_)
                | ShipperError::UnknownProcedure(_)
                | ShipperError::Allocation { .. }
                | ShipperError::Remote(_)
                | ShipperError::InvalidState(_)
                | ShipperError::MsgPackEncode(_)
                | ShipperError::MsgPackDecode(_)
        )
    }

    /// True for failures of the connection itself rather than of the call.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ShipperError::Io(_)
                | ShipperError::Transport(_)
                | ShipperError::ConnectionClosed
                | ShipperError::BackpressureTimeout
        )
    }

    /// Short, stable name of the error kind (used in logs and error frames).
    pub fn kind(&self) -> &'static str {
        match self {
            ShipperError::Io(_) => "io",
            ShipperError::Transport(_) => "transport",
            ShipperError::ConnectionClosed => "connection_closed",
            ShipperError::Truncation { .. } => "truncation",
            ShipperError::Malformed(_) => "malformed",
            ShipperError::DuplicateRegistration(_) => "duplicate_registration",
            ShipperError::UnknownProcedure(_) => "unknown_procedure",
            ShipperError::InvalidArgument(_) => "invalid_argument",
            ShipperError::Allocation { .. } => "allocation",
            ShipperError::Timeout => "timeout",
            ShipperError::InvalidState(_) => "invalid_state",
            ShipperError::Protocol(_) => "protocol",
            ShipperError::Remote(_) => "remote",
            ShipperError::BackpressureTimeout => "backpressure_timeout",
            ShipperError::ShuttingDown => "shutting_down",
            ShipperError::MsgPackEncode(_) => "msgpack_encode",
            ShipperError::MsgPackDecode(_) => "msgpack_decode",
            ShipperError::Json(_) => "json",
        }
    }
}

/// Result type alias using ShipperError.
pub type Result<T> = std::result::Result<T, ShipperError>;
