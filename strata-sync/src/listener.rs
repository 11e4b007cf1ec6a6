//! Server-side Connection Listener.
//!
//! Architecture:
//! ```text
//! Client A ──┐                              ┌── SyncSession A ──┐
//!            ├── TcpListener ── handshake ──┼── SyncSession B ──┼── FanOut
//! Client B ──┘   (accept loop)              └── ...             │     ▲
//!                                                               │     │ fan_out()
//!                                       Document.apply() ◄──────┘  Document
//!                                                                 listeners
//! ```
//!
//! Each accepted connection gets its own task running one Sync Session
//! bound to the shared document. The session starts in `Syncing` and is
//! registered with the fan-out group, so it receives a snapshot first and
//! incremental diffs only after it acknowledges. On disconnect the
//! session leaves the group and anything queued for it is dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use strata_core::{Document, SessionId, StatusCode, TaggedMutation};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::BindError;
use crate::fanout::{FanOut, FanOutReport, FanOutStats};
use crate::protocol::{Frame, FrameKind, Handshake, SyncMode};
use crate::session::{SessionRole, SyncSession};
use crate::status::{ListenerStatus, StatusCell, StatusWatch};
use crate::transport;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Connected sessions beyond this are rejected at handshake
    pub max_sessions: usize,
    /// Outbound mutations buffered per session before a resync is forced
    pub queue_capacity: usize,
    pub handshake_timeout: Duration,
    /// Close a connection that sends nothing for this long
    pub idle_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            queue_capacity: 10_000,
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Listener statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub active_sessions: usize,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub fan_out: FanOutStats,
}

#[derive(Default)]
struct AtomicListenerStats {
    total_connections: AtomicU64,
    rejected_connections: AtomicU64,
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Commands a connection task accepts from the listener.
#[derive(Debug)]
enum Control {
    /// Send `Goodbye` and close
    Kick(String),
}

struct ListenerInner {
    document: Arc<dyn Document>,
    config: ListenerConfig,
    fan_out: FanOut,
    status: StatusCell<ListenerStatus>,
    controls: Mutex<Vec<(SessionId, mpsc::UnboundedSender<Control>)>>,
    stats: AtomicListenerStats,
}

impl ListenerInner {
    fn refresh_session_count(&self) {
        let count = self.fan_out.session_count();
        self.status.update(|s| {
            let changed = s.connected_sessions != count;
            s.connected_sessions = count;
            changed
        });
    }

    fn count_out(&self, frames: usize, bytes: usize) {
        self.stats.frames_sent.fetch_add(frames as u64, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

struct Running {
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    accept: JoinHandle<()>,
}

/// Accepts connections and serves one Sync Session per client.
pub struct ConnectionListener {
    inner: Arc<ListenerInner>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl ConnectionListener {
    pub fn new(document: Arc<dyn Document>, config: ListenerConfig) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                document,
                config,
                fan_out: FanOut::new(),
                status: StatusCell::new(ListenerStatus::default()),
                controls: Mutex::new(Vec::new()),
                stats: AtomicListenerStats::default(),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.inner.config
    }

    pub fn document(&self) -> &Arc<dyn Document> {
        &self.inner.document
    }

    /// Bind `address` and start accepting. Use port 0 for an ephemeral
    /// port; the bound address is returned.
    ///
    /// Starting a running listener does not rebind: it reports
    /// `AlreadyRunning` and returns the current address.
    pub async fn start(&self, address: &str) -> Result<SocketAddr, BindError> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            log::warn!("Listener already running on {}", r.local_addr);
            self.inner.status.update(|s| {
                s.status = StatusCode::AlreadyRunning;
                true
            });
            return Ok(r.local_addr);
        }

        let listener = match bind(address).await {
            Ok(l) => l,
            Err(e) => {
                log::error!("{e}");
                self.inner.status.update(|s| {
                    s.running = false;
                    s.status = StatusCode::ErrorStarting;
                    true
                });
                return Err(e);
            }
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| BindError::InvalidAddress(e.to_string()))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let accept = tokio::spawn(accept_loop(self.inner.clone(), listener, stop_rx));
        *running = Some(Running {
            local_addr,
            stop_tx,
            accept,
        });

        self.inner.status.set(ListenerStatus {
            running: true,
            status: StatusCode::StartedOkay,
            local_addr: Some(local_addr),
            connected_sessions: 0,
        });
        log::info!("Sync listener on {local_addr}");
        Ok(local_addr)
    }

    /// Stop accepting, close every session and wait for the connection
    /// tasks to finish.
    pub async fn stop(&self) -> StatusCode {
        let Some(running) = self.running.lock().await.take() else {
            self.inner.status.update(|s| {
                s.status = StatusCode::AlreadyStopped;
                true
            });
            return StatusCode::AlreadyStopped;
        };

        let _ = running.stop_tx.send(true);
        let code = match running.accept.await {
            Ok(()) => StatusCode::StoppedOkay,
            Err(e) => {
                log::error!("Accept loop ended abnormally: {e}");
                StatusCode::ErrorStopping
            }
        };
        self.inner.fan_out.close_all();
        self.inner
            .controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        self.inner.status.set(ListenerStatus {
            running: false,
            status: code,
            local_addr: None,
            connected_sessions: 0,
        });
        log::info!("Sync listener on {} stopped", running.local_addr);
        code
    }

    /// Offer a document mutation to every connected session.
    pub fn fan_out(&self, tagged: &TaggedMutation) -> FanOutReport {
        self.inner.fan_out.fan_out(tagged)
    }

    /// Disconnect one client with a `Goodbye`. Returns false if no such
    /// session is connected.
    pub fn drop_session(&self, id: SessionId) -> bool {
        let controls = self.inner.controls.lock().unwrap_or_else(PoisonError::into_inner);
        match controls.iter().find(|(sid, _)| *sid == id) {
            Some((_, tx)) => tx.send(Control::Kick("dropped by server".into())).is_ok(),
            None => false,
        }
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<SyncSession>> {
        self.inner.fan_out.get(id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.fan_out.session_ids()
    }

    pub fn session_count(&self) -> usize {
        self.inner.fan_out.session_count()
    }

    pub fn active_session_count(&self) -> usize {
        self.inner.fan_out.active_count()
    }

    pub fn status(&self) -> StatusWatch<ListenerStatus> {
        self.inner.status.watch()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.status.get().local_addr
    }

    pub fn stats(&self) -> ListenerStats {
        let s = &self.inner.stats;
        ListenerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            rejected_connections: s.rejected_connections.load(Ordering::Relaxed),
            active_sessions: self.inner.fan_out.session_count(),
            frames_received: s.frames_received.load(Ordering::Relaxed),
            frames_sent: s.frames_sent.load(Ordering::Relaxed),
            bytes_received: s.bytes_received.load(Ordering::Relaxed),
            bytes_sent: s.bytes_sent.load(Ordering::Relaxed),
            fan_out: self.inner.fan_out.stats(),
        }
    }
}

impl Drop for ConnectionListener {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.stop_tx.send(true);
            running.accept.abort();
        }
        self.inner.fan_out.close_all();
    }
}

async fn bind(address: &str) -> Result<TcpListener, BindError> {
    let addr: SocketAddr = address
        .parse()
        .map_err(|_| BindError::InvalidAddress(address.to_string()))?;
    TcpListener::bind(addr).await.map_err(|e| BindError::Io {
        addr,
        reason: e.to_string(),
    })
}

async fn accept_loop(
    inner: Arc<ListenerInner>,
    listener: TcpListener,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    log::debug!("New TCP connection from {addr}");
                    inner.stats.total_connections.fetch_add(1, Ordering::Relaxed);
                    let inner = inner.clone();
                    let stop_rx = stop_rx.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(&inner, stream, addr, stop_rx).await {
                            log::warn!("Connection error from {addr}: {e}");
                        }
                    });
                }
                Err(e) => log::warn!("Accept failed: {e}"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    // Connection tasks watch the same stop signal and close themselves.
    while connections.join_next().await.is_some() {}
}

/// Handshake outcome for one socket.
enum Admission {
    Accepted(SyncMode),
    Refused(String),
}

async fn admit(
    inner: &ListenerInner,
    ws: &mut WebSocketStream<TcpStream>,
) -> Result<Admission, String> {
    let frame = loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                break transport::from_bytes(&data).map_err(|e| e.to_string())?;
            }
            Some(Ok(Message::Close(_))) | None => return Err("closed before handshake".into()),
            Some(Err(e)) => return Err(e.to_string()),
            Some(Ok(_)) => continue,
        }
    };

    let handshake: Handshake = match frame.handshake() {
        Ok(h) => h,
        Err(e) => return Ok(Admission::Refused(format!("expected Hello: {e}"))),
    };
    if let Err(reason) = handshake.validate() {
        return Ok(Admission::Refused(reason));
    }
    if inner.fan_out.session_count() >= inner.config.max_sessions {
        return Ok(Admission::Refused(format!(
            "server full ({} sessions)",
            inner.config.max_sessions
        )));
    }
    log::debug!("Peer {} handshake ok ({:?})", handshake.peer_id, handshake.mode);
    Ok(Admission::Accepted(handshake.mode))
}

async fn handle_connection(
    inner: &Arc<ListenerInner>,
    stream: TcpStream,
    addr: SocketAddr,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<(), String> {
    let mut ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| e.to_string())?;

    let admission = tokio::time::timeout(inner.config.handshake_timeout, admit(inner, &mut ws))
        .await
        .map_err(|_| "handshake timed out".to_string())??;
    let mode = match admission {
        Admission::Accepted(mode) => mode,
        Admission::Refused(reason) => {
            log::warn!("Rejecting {addr}: {reason}");
            inner.stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
            let reject = Frame::reject(&reason).map_err(|e| e.to_string())?;
            let _ = transport::send_frames(&mut ws, &[reject]).await;
            let _ = ws.close(None).await;
            return Ok(());
        }
    };

    let session = Arc::new(SyncSession::new(
        SessionId::new(),
        SessionRole::Server,
        mode,
        inner.config.queue_capacity,
    ));
    let id = session.id();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    inner
        .controls
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push((id, control_tx));
    inner.fan_out.add(session.clone());
    inner.refresh_session_count();
    log::info!("Session {id} opened for {addr}");

    let (mut sink, mut stream) = ws.split();
    let document = inner.document.as_ref();

    let result: Result<(), String> = 'conn: {
        let mut opening = match Frame::welcome(id) {
            Ok(welcome) => vec![welcome],
            Err(e) => break 'conn Err(e.to_string()),
        };
        opening.extend(session.start(document));
        match transport::send_frames(&mut sink, &opening).await {
            Ok(bytes) => inner.count_out(opening.len(), bytes),
            Err(e) => break 'conn Err(e.to_string()),
        }

        let idle = tokio::time::sleep(inner.config.idle_timeout);
        tokio::pin!(idle);

        loop {
            let outgoing = tokio::select! {
                _ = stop_rx.changed() => {
                    if let Ok(bye) = Frame::goodbye("server stopping") {
                        let _ = transport::send_frames(&mut sink, &[bye]).await;
                    }
                    let _ = sink.close().await;
                    break 'conn Ok(());
                }

                Some(control) = control_rx.recv() => match control {
                    Control::Kick(reason) => {
                        log::info!("Dropping session {id}: {reason}");
                        if let Ok(bye) = Frame::goodbye(&reason) {
                            let _ = transport::send_frames(&mut sink, &[bye]).await;
                        }
                        let _ = sink.close().await;
                        break 'conn Ok(());
                    }
                },

                msg = stream.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        idle.as_mut().reset(Instant::now() + inner.config.idle_timeout);
                        inner.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                        inner.stats.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);
                        match transport::from_bytes(&data) {
                            Ok(frame) if frame.kind == FrameKind::Goodbye => {
                                log::info!("Session {id} said goodbye");
                                break 'conn Ok(());
                            }
                            Ok(frame) => session.receive(document, &frame),
                            Err(e) => {
                                log::warn!("Undecodable frame from {addr}: {e}");
                                session.request_resync(document)
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        idle.as_mut().reset(Instant::now() + inner.config.idle_timeout);
                        if let Err(e) = sink.send(Message::Pong(payload)).await {
                            break 'conn Err(e.to_string());
                        }
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break 'conn Ok(());
                    }
                    Some(Err(e)) => break 'conn Err(e.to_string()),
                    Some(Ok(_)) => continue,
                },

                _ = session.outbound_ready() => session.poll_outbound(document),

                _ = &mut idle => {
                    log::warn!("Session {id} idle for {:?}, closing", inner.config.idle_timeout);
                    let _ = sink.close().await;
                    break 'conn Ok(());
                }
            };

            match transport::send_frames(&mut sink, &outgoing).await {
                Ok(bytes) => inner.count_out(outgoing.len(), bytes),
                Err(e) => break 'conn Err(e.to_string()),
            }
        }
    };

    inner.fan_out.remove(id);
    inner
        .controls
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|(sid, _)| *sid != id);
    inner.refresh_session_count();
    log::info!("Session {id} closed");
    result
}
