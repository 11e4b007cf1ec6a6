//! # strata-sync — change propagation for strata documents
//!
//! Keeps replicas of a [`strata_core::Document`] consistent over
//! WebSocket connections, or between two documents in one process.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐      WebSocket       ┌──────────────────┐
//! │ ConnectionEnd-   │ ◄──────────────────► │ Connection-      │
//! │ point (client)   │   length-prefixed    │ Listener (server)│
//! └────────┬─────────┘       frames         └────────┬─────────┘
//!          │                                         │
//!          ▼                                         ▼
//! ┌──────────────────┐                      ┌──────────────────┐
//! │ SyncSession      │                      │ FanOut           │
//! │ seq / resync     │                      │ SyncSession × N  │
//! └────────┬─────────┘                      └────────┬─────────┘
//!          │ UpdateQueue                             │ UpdateQueue × N
//!          ▼                                         ▼
//! ┌──────────────────┐                      ┌──────────────────┐
//! │ Document replica │                      │ Document         │
//! └──────────────────┘                      └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`] — versioned binary encoding of one mutation
//! - [`queue`] — ordered, coalescing outbound buffer with suppression
//! - [`protocol`] — wire frames and handshake
//! - [`session`] — per-connection sequencing, snapshot and resync
//! - [`fanout`] — server-side session registry and broadcast
//! - [`endpoint`] — client connection with reconnect and heartbeat
//! - [`listener`] — server accept loop
//! - [`controller`] — binds a document to one endpoint or listener
//! - [`mirror`] — in-process one-way replication
//! - [`status`] — observable connection status
//!
//! ## Guarantees
//!
//! - Every session starts with a full snapshot.
//! - Diffs within a session are applied in sequence order; a gap, an
//!   undecodable frame or a rejected mutation triggers a resync.
//! - A mutation is never sent back to the session it came from.

pub mod codec;
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod fanout;
pub mod listener;
pub mod mirror;
pub mod protocol;
pub mod queue;
pub mod reconnect;
pub mod session;
pub mod status;
pub mod transport;

pub use codec::FORMAT_VERSION;
pub use controller::{SyncController, SyncRole};
pub use endpoint::{ConnectionEndpoint, EndpointConfig, EndpointStats};
pub use error::{BindError, ConnectError, DecodeError, EncodeError, SendError, SyncError};
pub use fanout::{FanOut, FanOutReport, FanOutStats};
pub use listener::{ConnectionListener, ListenerConfig, ListenerStats};
pub use mirror::LocalSync;
pub use protocol::{Frame, FrameKind, Handshake, SyncMode, MAGIC, PROTOCOL_VERSION};
pub use queue::{Enqueued, UpdateQueue};
pub use reconnect::{Backoff, ReconnectPolicy};
pub use session::{Offer, SessionRole, SessionState, SessionStats, SyncSession};
pub use status::{ConnectionState, EndpointStatus, ListenerStatus, StatusCell, StatusWatch};
