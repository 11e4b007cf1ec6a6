//! Client-side Connection Endpoint.
//!
//! ```text
//!   Disconnected ──connect()──► Connecting ──Welcome──► Connected
//!        ▲                          │  ▲                   │
//!        │                  refused │  └── backoff retry ──┤ network failure
//!        │                          ▼                      │
//!        │                  Failed(reason) ◄── budget spent┘
//!        └──────────── disconnect() (terminal, never retried)
//! ```
//!
//! Provides:
//! - Handshake (`Hello` → `Welcome`/`Reject`) with a timeout
//! - One Sync Session per live connection, fed from a single task
//! - Heartbeat pings; three silent intervals count as a network failure
//! - Automatic reconnection with bounded exponential backoff; every
//!   reconnect starts a fresh session and a full resync
//! - Status exposed as a watchable property

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use strata_core::{Document, SessionId, TaggedMutation};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::error::{ConnectError, SendError};
use crate::protocol::{Frame, FrameKind, Handshake, SyncMode};
use crate::reconnect::ReconnectPolicy;
use crate::session::{Offer, SessionRole, SyncSession};
use crate::status::{ConnectionState, EndpointStatus, StatusCell, StatusWatch};
use crate::transport;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Identity sent in `Hello`
    pub peer_id: Uuid,
    pub mode: SyncMode,
    /// Outbound mutations buffered before a resync is forced
    pub queue_capacity: usize,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            peer_id: Uuid::new_v4(),
            mode: SyncMode::Bidirectional,
            queue_capacity: 10_000,
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Endpoint traffic counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub decode_errors: u64,
    /// Successful reconnects after a network failure
    pub reconnects: u64,
}

#[derive(Default)]
struct AtomicEndpointStats {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    decode_errors: AtomicU64,
    reconnects: AtomicU64,
}

/// How one connection ended.
enum DriveEnd {
    /// `disconnect()` was called
    Stopped,
    /// Network failure; eligible for reconnect
    Lost(String),
}

struct EndpointInner {
    document: Arc<dyn Document>,
    config: EndpointConfig,
    status: StatusCell<EndpointStatus>,
    session: RwLock<Option<Arc<SyncSession>>>,
    raw_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    stats: AtomicEndpointStats,
}

impl EndpointInner {
    fn set_state(&self, state: ConnectionState, session: Option<SessionId>, attempt: u32) {
        self.status.set(EndpointStatus {
            state,
            session,
            reconnect_attempt: attempt,
        });
    }

    fn install_session(&self, session: Option<Arc<SyncSession>>) {
        let mut slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = slot.take() {
            old.close();
        }
        *slot = session;
    }

    fn current_session(&self) -> Option<Arc<SyncSession>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn count_out(&self, frames: usize, bytes: usize) {
        self.stats.frames_sent.fetch_add(frames as u64, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// One outbound connection to a listener.
pub struct ConnectionEndpoint {
    inner: Arc<EndpointInner>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionEndpoint {
    pub fn new(document: Arc<dyn Document>, config: EndpointConfig) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                document,
                config,
                status: StatusCell::new(EndpointStatus::default()),
                session: RwLock::new(None),
                raw_tx: Mutex::new(None),
                stats: AtomicEndpointStats::default(),
            }),
            stop_tx: Mutex::new(None),
            supervisor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    pub fn document(&self) -> &Arc<dyn Document> {
        &self.inner.document
    }

    /// Connect to a listener at `address` (`host:port` or a `ws://` URL).
    ///
    /// Makes a single attempt. On failure the status becomes
    /// `Failed(reason)` and the error is returned; automatic retries only
    /// follow the loss of an established connection.
    pub async fn connect(&self, address: &str) -> Result<(), ConnectError> {
        if self.is_running() {
            return Err(ConnectError::AlreadyConnected);
        }
        let url = normalize_address(address)?;

        self.inner.set_state(ConnectionState::Connecting, None, 0);
        log::info!("Connecting to {url}");

        let (ws, session_id) = match establish(&url, &self.inner.config).await {
            Ok(link) => link,
            Err(e) => {
                log::warn!("Connection to {url} failed: {e}");
                self.inner
                    .set_state(ConnectionState::Failed(e.to_string()), None, 0);
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop_tx);

        let inner = self.inner.clone();
        let handle = tokio::spawn(supervise(inner, url, ws, session_id, stop_rx));
        *self.supervisor.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Close the connection. Terminal: no reconnect follows.
    pub async fn disconnect(&self) {
        let stop = self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let handle = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner).take();

        if let Some(stop) = stop {
            let session = self.inner.status.get().session;
            self.inner.set_state(ConnectionState::Closing, session, 0);
            let _ = stop.send(true);
        }
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.install_session(None);
        self.inner.set_state(ConnectionState::Disconnected, None, 0);
    }

    /// Send pre-encoded frame bytes on the current connection.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), SendError> {
        let tx = self
            .inner
            .raw_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SendError::NotConnected)?;
        tx.send(bytes).await.map_err(|_| SendError::NotConnected)
    }

    /// Encode and send one frame.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), SendError> {
        self.send(frame.encode()?).await
    }

    /// Offer a document mutation to the current session.
    pub fn push_local(&self, tagged: &TaggedMutation) -> Offer {
        match self.inner.current_session() {
            Some(session) => session.offer(tagged),
            None => Offer::Closed,
        }
    }

    pub fn status(&self) -> StatusWatch<EndpointStatus> {
        self.inner.status.watch()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status.get().state
    }

    pub fn session(&self) -> Option<Arc<SyncSession>> {
        self.inner.current_session()
    }

    pub fn stats(&self) -> EndpointStats {
        let s = &self.inner.stats;
        EndpointStats {
            frames_sent: s.frames_sent.load(Ordering::Relaxed),
            frames_received: s.frames_received.load(Ordering::Relaxed),
            bytes_sent: s.bytes_sent.load(Ordering::Relaxed),
            bytes_received: s.bytes_received.load(Ordering::Relaxed),
            decode_errors: s.decode_errors.load(Ordering::Relaxed),
            reconnects: s.reconnects.load(Ordering::Relaxed),
        }
    }

    fn is_running(&self) -> bool {
        self.supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ConnectionEndpoint {
    fn drop(&mut self) {
        if let Some(handle) = self
            .supervisor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.inner.install_session(None);
    }
}

fn normalize_address(address: &str) -> Result<String, ConnectError> {
    let address = address.trim();
    if address.starts_with("ws://") || address.starts_with("wss://") {
        return Ok(address.to_string());
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(format!("ws://{address}"))
        }
        _ => Err(ConnectError::InvalidAddress(address.to_string())),
    }
}

/// Open the socket and run the handshake.
async fn establish(url: &str, config: &EndpointConfig) -> Result<(WsStream, SessionId), ConnectError> {
    let handshake = async {
        let (mut ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))?;

        let hello = Frame::hello(&Handshake::new(config.peer_id, config.mode))
            .and_then(|f| transport::to_message(&f))
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;
        ws.send(hello)
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))?;

        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let frame = transport::from_bytes(&data)
                        .map_err(|e| ConnectError::Handshake(e.to_string()))?;
                    return match frame.kind {
                        FrameKind::Welcome => {
                            let id = frame
                                .session_id()
                                .map_err(|e| ConnectError::Handshake(e.to_string()))?;
                            Ok((ws, id))
                        }
                        FrameKind::Reject => Err(ConnectError::Handshake(format!(
                            "rejected: {}",
                            frame.reason().unwrap_or_default()
                        ))),
                        other => Err(ConnectError::Handshake(format!(
                            "unexpected {other:?} frame"
                        ))),
                    };
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ConnectError::Handshake(
                        "connection closed during handshake".into(),
                    ));
                }
                Some(Err(e)) => return Err(ConnectError::Transport(e.to_string())),
                Some(Ok(_)) => continue,
            }
        }
    };

    tokio::time::timeout(config.handshake_timeout, handshake)
        .await
        .map_err(|_| ConnectError::Timeout(config.handshake_timeout))?
}

/// Connection lifetime: drive, and on network failure reconnect with
/// backoff until stopped or the retry budget runs out.
async fn supervise(
    inner: Arc<EndpointInner>,
    url: String,
    mut ws: WsStream,
    mut session_id: SessionId,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let session = Arc::new(SyncSession::new(
            session_id,
            SessionRole::Client,
            inner.config.mode,
            inner.config.queue_capacity,
        ));
        inner.install_session(Some(session.clone()));
        inner.set_state(ConnectionState::Connected, Some(session_id), 0);
        log::info!("Connected to {url} as session {session_id}");

        let reason = match drive(&inner, ws, &session, &mut stop_rx).await {
            DriveEnd::Stopped => {
                inner.install_session(None);
                log::info!("Disconnected from {url}");
                return;
            }
            DriveEnd::Lost(reason) => reason,
        };
        inner.install_session(None);
        log::warn!("Lost connection to {url}: {reason}");

        if !inner.config.reconnect.enabled {
            inner.set_state(ConnectionState::Disconnected, None, 0);
            return;
        }

        let mut backoff = inner.config.reconnect.backoff();
        let mut last_error = reason;
        let link = loop {
            let Some((attempt, delay)) = backoff.next_delay() else {
                let reason = format!(
                    "gave up after {} reconnect attempts: {last_error}",
                    backoff.attempt()
                );
                log::error!("{url}: {reason}");
                inner.set_state(ConnectionState::Failed(reason), None, backoff.attempt());
                return;
            };
            inner.set_state(ConnectionState::Connecting, None, attempt);
            log::info!("Reconnecting to {url} (attempt {attempt}) in {delay:?}");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_rx.changed() => return,
            }
            let result = tokio::select! {
                result = establish(&url, &inner.config) => result,
                _ = stop_rx.changed() => return,
            };
            match result {
                Ok(link) => break link,
                Err(e) => {
                    log::debug!("Reconnect attempt {attempt} to {url} failed: {e}");
                    last_error = e.to_string();
                }
            }
        };

        inner.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        (ws, session_id) = link;
    }
}

/// Pump one connection until it ends.
async fn drive(
    inner: &EndpointInner,
    ws: WsStream,
    session: &SyncSession,
    stop_rx: &mut watch::Receiver<bool>,
) -> DriveEnd {
    let document = inner.document.as_ref();
    let (mut sink, mut stream) = ws.split();

    let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<u8>>(256);
    *inner.raw_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(raw_tx);

    let interval = inner.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_heard = Instant::now();

    let end = 'conn: {
        let opening = session.start(document);
        if let Err(e) = transport::send_frames(&mut sink, &opening).await {
            break 'conn DriveEnd::Lost(e.to_string());
        }

        loop {
            let outgoing = tokio::select! {
                _ = stop_rx.changed() => {
                    if let Ok(bye) = Frame::goodbye("client disconnect") {
                        let _ = transport::send_frames(&mut sink, &[bye]).await;
                    }
                    let _ = sink.close().await;
                    break 'conn DriveEnd::Stopped;
                }

                msg = stream.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        last_heard = Instant::now();
                        inner.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                        inner.stats.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);
                        match transport::from_bytes(&data) {
                            Ok(frame) if frame.kind == FrameKind::Goodbye => {
                                let reason = frame.reason().unwrap_or_default();
                                break 'conn DriveEnd::Lost(format!("server said goodbye: {reason}"));
                            }
                            Ok(frame) => session.receive(document, &frame),
                            Err(e) => {
                                inner.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                                log::warn!("Undecodable frame from server: {e}");
                                session.request_resync(document)
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_heard = Instant::now();
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break 'conn DriveEnd::Lost("socket closed".into());
                        }
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break 'conn DriveEnd::Lost("closed by server".into());
                    }
                    Some(Err(e)) => break 'conn DriveEnd::Lost(e.to_string()),
                    Some(Ok(_)) => {
                        last_heard = Instant::now();
                        continue;
                    }
                },

                _ = session.outbound_ready() => session.poll_outbound(document),

                Some(bytes) = raw_rx.recv() => {
                    let len = bytes.len();
                    if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                        break 'conn DriveEnd::Lost(e.to_string());
                    }
                    inner.count_out(1, len);
                    continue;
                }

                _ = heartbeat.tick() => {
                    if last_heard.elapsed() > interval * 3 {
                        break 'conn DriveEnd::Lost("heartbeat timeout".into());
                    }
                    vec![Frame::ping()]
                }
            };

            match transport::send_frames(&mut sink, &outgoing).await {
                Ok(bytes) => inner.count_out(outgoing.len(), bytes),
                Err(e) => break 'conn DriveEnd::Lost(e.to_string()),
            }
        }
    };

    *inner.raw_tx.lock().unwrap_or_else(PoisonError::into_inner) = None;
    session.close();
    end
}
