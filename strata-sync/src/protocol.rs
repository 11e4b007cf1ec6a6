//! Wire protocol between a listener and its endpoints.
//!
//! Every WebSocket binary message carries exactly one frame:
//! ```text
//! ┌────────────┬──────────────────────────────────────────────┐
//! │ body len   │ bincode(Frame)                               │
//! │ u32 BE     │ kind (1 byte) │ seq (varint) │ payload      │
//! └────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Session lifecycle:
//! ```text
//!   client                              server
//!     │ ── Hello{magic, version, id} ──►  │
//!     │ ◄── Welcome{session} ──────────── │
//!     │ ◄── Snapshot{seq 0, [..]} ─────── │
//!     │ ── SnapshotAck ────────────────►  │
//!     │ ◄─────── Diff{seq n} ───────────► │   (both directions)
//!     │ ── SnapshotRequest ────────────►  │   (after a gap)
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strata_core::{Mutation, SessionId};
use uuid::Uuid;

use crate::codec;
use crate::error::{DecodeError, EncodeError};

/// Identifies a Strata peer in the `Hello` frame.
pub const MAGIC: u32 = 0x000C_3110;

pub const PROTOCOL_VERSION: u16 = 1;

/// Length prefix width.
pub const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// Client handshake
    Hello = 1,
    /// Handshake accepted, carries the session id
    Welcome = 2,
    /// Handshake refused, carries a reason
    Reject = 3,
    /// Full state, always sequence 0
    Snapshot = 4,
    /// Ask the peer for a fresh snapshot
    SnapshotRequest = 5,
    /// Snapshot applied
    SnapshotAck = 6,
    /// One incremental mutation
    Diff = 7,
    /// Heartbeat ping
    Ping = 8,
    /// Heartbeat pong
    Pong = 9,
    /// Orderly close, carries a reason
    Goodbye = 10,
}

/// Which directions a client replicates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncMode {
    /// Send local mutations and receive remote ones
    #[default]
    Bidirectional,
    /// Mirror the server; local mutations are never sent
    ReceiveOnly,
}

/// `Hello` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub magic: u32,
    pub version: u16,
    pub peer_id: Uuid,
    pub mode: SyncMode,
}

impl Handshake {
    pub fn new(peer_id: Uuid, mode: SyncMode) -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            peer_id,
            mode,
        }
    }

    /// Why this handshake must be refused, if it must.
    pub fn validate(&self) -> Result<(), String> {
        if self.magic != MAGIC {
            return Err(format!("bad magic {:#010x}", self.magic));
        }
        if self.version != PROTOCOL_VERSION {
            return Err(format!(
                "protocol version {} not supported (expected {PROTOCOL_VERSION})",
                self.version
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    /// Diff sequence number, or the snapshot generation on `Snapshot`
    /// and `SnapshotAck`; 0 elsewhere
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    fn bare(kind: FrameKind) -> Self {
        Self {
            kind,
            seq: 0,
            payload: Vec::new(),
        }
    }

    fn with_payload<T: Serialize>(kind: FrameKind, value: &T) -> Result<Self, EncodeError> {
        let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| EncodeError(e.to_string()))?;
        Ok(Self {
            kind,
            seq: 0,
            payload,
        })
    }

    pub fn hello(handshake: &Handshake) -> Result<Self, EncodeError> {
        Self::with_payload(FrameKind::Hello, handshake)
    }

    pub fn welcome(session: SessionId) -> Result<Self, EncodeError> {
        Self::with_payload(FrameKind::Welcome, &session)
    }

    pub fn reject(reason: &str) -> Result<Self, EncodeError> {
        Self::with_payload(FrameKind::Reject, &reason)
    }

    /// Snapshot frame of generation `generation` carrying `mutations`,
    /// each Diff-Codec encoded.
    pub fn snapshot(generation: u32, mutations: &[Mutation]) -> Result<Self, EncodeError> {
        let mut frame = Self::with_payload(FrameKind::Snapshot, &codec::encode_batch(mutations)?)?;
        frame.seq = generation;
        Ok(frame)
    }

    pub fn snapshot_request() -> Self {
        Self::bare(FrameKind::SnapshotRequest)
    }

    pub fn snapshot_ack(generation: u32) -> Self {
        Self {
            seq: generation,
            ..Self::bare(FrameKind::SnapshotAck)
        }
    }

    pub fn diff(seq: u32, mutation: &Mutation) -> Result<Self, EncodeError> {
        Ok(Self {
            kind: FrameKind::Diff,
            seq,
            payload: codec::encode(mutation)?,
        })
    }

    pub fn ping() -> Self {
        Self::bare(FrameKind::Ping)
    }

    pub fn pong() -> Self {
        Self::bare(FrameKind::Pong)
    }

    pub fn goodbye(reason: &str) -> Result<Self, EncodeError> {
        Self::with_payload(FrameKind::Goodbye, &reason)
    }

    /// Serialize to the length-prefixed wire format.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| EncodeError(e.to_string()))?;
        let len = u32::try_from(body.len())
            .map_err(|_| EncodeError(format!("frame of {} bytes too large", body.len())))?;
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse one length-prefixed frame. The buffer must hold exactly one.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::Malformed(format!(
                "{} bytes is shorter than the frame header",
                bytes.len()
            )));
        }
        let (header, body) = bytes.split_at(HEADER_LEN);
        let declared = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if declared != body.len() {
            return Err(DecodeError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }
        let (frame, read): (Frame, usize) =
            bincode::serde::decode_from_slice(body, bincode::config::standard())
                .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        if read != body.len() {
            return Err(DecodeError::TrailingBytes(body.len() - read));
        }
        Ok(frame)
    }

    fn expect_kind(&self, kind: FrameKind, expected: &'static str) -> Result<(), DecodeError> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(DecodeError::UnexpectedFrame { expected })
        }
    }

    fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        let (value, read): (T, usize) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        if read != self.payload.len() {
            return Err(DecodeError::TrailingBytes(self.payload.len() - read));
        }
        Ok(value)
    }

    pub fn handshake(&self) -> Result<Handshake, DecodeError> {
        self.expect_kind(FrameKind::Hello, "Hello")?;
        self.parse_payload()
    }

    pub fn session_id(&self) -> Result<SessionId, DecodeError> {
        self.expect_kind(FrameKind::Welcome, "Welcome")?;
        self.parse_payload()
    }

    /// The mutation carried by a `Diff`.
    pub fn mutation(&self) -> Result<Mutation, DecodeError> {
        self.expect_kind(FrameKind::Diff, "Diff")?;
        codec::decode(&self.payload)
    }

    /// The mutations carried by a `Snapshot`.
    pub fn mutations(&self) -> Result<Vec<Mutation>, DecodeError> {
        self.expect_kind(FrameKind::Snapshot, "Snapshot")?;
        let encoded: Vec<Vec<u8>> = self.parse_payload()?;
        codec::decode_batch(&encoded)
    }

    /// Reason carried by `Reject` or `Goodbye`.
    pub fn reason(&self) -> Result<String, DecodeError> {
        match self.kind {
            FrameKind::Reject | FrameKind::Goodbye => self.parse_payload(),
            _ => Err(DecodeError::UnexpectedFrame {
                expected: "Reject or Goodbye",
            }),
        }
    }
}
