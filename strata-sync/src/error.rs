//! Error taxonomy for the replication engine.
//!
//! Decode and apply failures never escape a session: they are logged
//! and answered with a resync. Only connection setup failures and
//! exhausted retry budgets reach the owner.

use std::net::SocketAddr;

/// A frame or mutation that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty input")]
    Empty,

    #[error("unsupported format version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("frame declares {declared} bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("expected a {expected} frame")]
    UnexpectedFrame { expected: &'static str },
}

/// Serialization failure. Only reachable through serde implementations
/// that refuse to encode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("encode failed: {0}")]
pub struct EncodeError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("endpoint is already connected")]
    AlreadyConnected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("cannot bind {addr}: {reason}")]
    Io { addr: SocketAddr, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Controller-level error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Connect(#[from] ConnectError),
}
