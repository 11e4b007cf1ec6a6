//! Observable connection status.
//!
//! The owning endpoint or listener holds the only [`StatusCell`]; anyone
//! else gets a read-only [`StatusWatch`] and can await changes instead of
//! polling.

use std::fmt;
use std::net::SocketAddr;

use strata_core::{SessionId, StatusCode};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Closing => f.write_str("closing"),
            ConnectionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Client-side status surface.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndpointStatus {
    pub state: ConnectionState,
    /// Session assigned by the server for the current connection
    pub session: Option<SessionId>,
    /// Reconnect attempt in progress, 0 when not reconnecting
    pub reconnect_attempt: u32,
}

/// Server-side status surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerStatus {
    pub running: bool,
    /// Outcome of the last start or stop
    pub status: StatusCode,
    pub local_addr: Option<SocketAddr>,
    pub connected_sessions: usize,
}

impl Default for ListenerStatus {
    fn default() -> Self {
        Self {
            running: false,
            status: StatusCode::Initialized,
            local_addr: None,
            connected_sessions: 0,
        }
    }
}

/// Writable side of a status property.
#[derive(Debug)]
pub struct StatusCell<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone> StatusCell<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Modify in place; watchers are woken only if `f` returns true.
    pub fn update(&self, f: impl FnOnce(&mut T) -> bool) {
        self.tx.send_if_modified(f);
    }

    pub fn watch(&self) -> StatusWatch<T> {
        StatusWatch {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only view of a status property.
#[derive(Debug, Clone)]
pub struct StatusWatch<T> {
    rx: watch::Receiver<T>,
}

impl<T: Clone> StatusWatch<T> {
    pub fn get(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Wait for the next change. Returns `None` once the owner is gone.
    pub async fn changed(&mut self) -> Option<T> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until `predicate` holds, checking the current value first.
    pub async fn wait_for(&mut self, predicate: impl FnMut(&T) -> bool) -> Option<T> {
        self.rx.wait_for(predicate).await.ok().map(|v| T::clone(&v))
    }
}
