//! Sync Session: one live connection's view of the shared document.
//!
//! ```text
//!            start()          SnapshotAck / Snapshot applied
//!   Idle ────────────► Syncing ─────────────────────────────► Active
//!                        ▲                                      │
//!                        └──── seq gap / decode / apply error ──┘
//!   any ── close() ──► Closed
//! ```
//!
//! A session is transport-agnostic: the connection task feeds it inbound
//! frames through [`SyncSession::receive`] and writes whatever frames it
//! returns, and drains locally produced diffs with
//! [`SyncSession::poll_outbound`] whenever [`SyncSession::outbound_ready`]
//! fires. Document listeners reach it through [`SyncSession::offer`].
//!
//! Every snapshot a server session sends carries a new generation in
//! its `seq`; only the ack of the latest one moves it to `Active`. A
//! client keeps queueing local edits while syncing and drops the queue
//! at the moment a snapshot entry lands in its document.
//!
//! Lock order is cursor, then outbound queue. No session lock is ever
//! held while calling into the document, because the document calls
//! `offer` from inside its own lock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use strata_core::{Document, Mutation, SessionId, TaggedMutation, UpdateSource};
use tokio::sync::Notify;

use crate::protocol::{Frame, FrameKind, SyncMode};
use crate::queue::{Enqueued, UpdateQueue};

/// Which end of the connection a session sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Authoritative side; sends snapshots
    Server,
    /// Replica side; requests snapshots
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Syncing,
    Active,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Syncing => "syncing",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What [`SyncSession::offer`] did with a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    Coalesced,
    /// Delivered by this session, or the session never transmits
    Suppressed,
    /// Session not active yet; the next snapshot will carry it
    Deferred,
    /// Outbound queue full; a resync has been scheduled
    Overflow,
    Closed,
}

impl Offer {
    pub fn accepted(self) -> bool {
        matches!(self, Offer::Queued | Offer::Coalesced)
    }
}

/// Point-in-time copy of a session's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_received: u64,
    pub diffs_applied: u64,
    pub diffs_sent: u64,
    pub snapshots_sent: u64,
    pub snapshots_applied: u64,
    pub resyncs: u64,
    pub suppressed: u64,
    pub deferred: u64,
    pub coalesced: u64,
    pub decode_errors: u64,
    pub apply_errors: u64,
}

#[derive(Default)]
struct AtomicSessionStats {
    frames_received: AtomicU64,
    diffs_applied: AtomicU64,
    diffs_sent: AtomicU64,
    snapshots_sent: AtomicU64,
    snapshots_applied: AtomicU64,
    resyncs: AtomicU64,
    suppressed: AtomicU64,
    deferred: AtomicU64,
    decode_errors: AtomicU64,
    apply_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct Cursor {
    state: SessionState,
    last_applied: u32,
    last_sent: u32,
    /// Server only: a mutation was skipped while syncing
    missed: bool,
    /// Server only: generation of the latest snapshot sent
    snapshot_generation: u32,
    /// Client only: an entry of the snapshot being applied reached the
    /// document
    snapshot_landed: bool,
    /// The outbound queue overflowed; resync on the next poll
    needs_resync: bool,
}

pub struct SyncSession {
    id: SessionId,
    role: SessionRole,
    mode: SyncMode,
    source: UpdateSource,
    cursor: Mutex<Cursor>,
    outbound: Mutex<UpdateQueue>,
    stats: AtomicSessionStats,
    wake: Notify,
}

impl SyncSession {
    pub fn new(id: SessionId, role: SessionRole, mode: SyncMode, queue_capacity: usize) -> Self {
        let outbound =
            UpdateQueue::new(queue_capacity).with_suppressor(move |t| t.origin.is_from(id));
        Self {
            id,
            role,
            mode,
            source: UpdateSource::remote(id),
            cursor: Mutex::new(Cursor {
                state: SessionState::Idle,
                last_applied: 0,
                last_sent: 0,
                missed: false,
                snapshot_generation: 0,
                snapshot_landed: false,
                needs_resync: false,
            }),
            outbound: Mutex::new(outbound),
            stats: AtomicSessionStats::default(),
            wake: Notify::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Source inbound mutations are applied through.
    pub fn update_source(&self) -> &UpdateSource {
        &self.source
    }

    pub fn state(&self) -> SessionState {
        self.cursor().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn last_applied(&self) -> u32 {
        self.cursor().last_applied
    }

    pub fn last_sent(&self) -> u32 {
        self.cursor().last_sent
    }

    /// Mutations queued for transmission.
    pub fn pending(&self) -> usize {
        self.outbound().len()
    }

    pub fn stats(&self) -> SessionStats {
        let s = &self.stats;
        SessionStats {
            frames_received: s.frames_received.load(Ordering::Relaxed),
            diffs_applied: s.diffs_applied.load(Ordering::Relaxed),
            diffs_sent: s.diffs_sent.load(Ordering::Relaxed),
            snapshots_sent: s.snapshots_sent.load(Ordering::Relaxed),
            snapshots_applied: s.snapshots_applied.load(Ordering::Relaxed),
            resyncs: s.resyncs.load(Ordering::Relaxed),
            suppressed: s.suppressed.load(Ordering::Relaxed),
            deferred: s.deferred.load(Ordering::Relaxed),
            coalesced: self.outbound().coalesced_count(),
            decode_errors: s.decode_errors.load(Ordering::Relaxed),
            apply_errors: s.apply_errors.load(Ordering::Relaxed),
        }
    }

    /// Resolves once there is something for [`poll_outbound`](Self::poll_outbound)
    /// to do. Wake-ups are not lost if nobody is waiting yet.
    pub async fn outbound_ready(&self) {
        self.wake.notified().await
    }

    fn cursor(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbound(&self) -> MutexGuard<'_, UpdateQueue> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter `Syncing`. A server session returns the opening snapshot;
    /// a client session returns nothing, its handshake already asked
    /// for one.
    pub fn start<D: Document + ?Sized>(&self, document: &D) -> Vec<Frame> {
        log::debug!("session {} ({:?}) starting", self.id, self.role);
        match self.role {
            SessionRole::Server => self.send_snapshot(document),
            SessionRole::Client => {
                let mut cursor = self.cursor();
                if cursor.state != SessionState::Closed {
                    cursor.state = SessionState::Syncing;
                }
                Vec::new()
            }
        }
    }

    /// Offer a mutation observed on the document for transmission.
    ///
    /// Never blocks on I/O; safe to call from inside a document listener.
    pub fn offer(&self, tagged: &TaggedMutation) -> Offer {
        if self.source.originated(tagged) {
            self.note_own_mutation();
            bump(&self.stats.suppressed);
            return Offer::Suppressed;
        }
        if self.role == SessionRole::Client && self.mode == SyncMode::ReceiveOnly {
            bump(&self.stats.suppressed);
            return Offer::Suppressed;
        }

        let outcome = {
            let mut cursor = self.cursor();
            let queues = match (cursor.state, self.role) {
                (SessionState::Closed, _) => return Offer::Closed,
                (SessionState::Active, _) | (SessionState::Syncing, SessionRole::Client) => true,
                (SessionState::Idle, _) | (SessionState::Syncing, SessionRole::Server) => false,
            };
            if !queues {
                cursor.missed = true;
                bump(&self.stats.deferred);
                return Offer::Deferred;
            }
            match self.outbound().enqueue(tagged.clone()) {
                Enqueued::Queued => Offer::Queued,
                Enqueued::Coalesced => Offer::Coalesced,
                Enqueued::Suppressed => {
                    bump(&self.stats.suppressed);
                    return Offer::Suppressed;
                }
                Enqueued::Full => {
                    cursor.needs_resync = true;
                    Offer::Overflow
                }
            }
        };

        if outcome == Offer::Overflow {
            log::warn!("session {} outbound queue full, scheduling resync", self.id);
        }
        self.wake.notify_one();
        outcome
    }

    /// A client applies nothing of its own while syncing except snapshot
    /// entries, and each one overwrites whatever was queued before it.
    fn note_own_mutation(&self) {
        if self.role != SessionRole::Client {
            return;
        }
        let mut cursor = self.cursor();
        if cursor.state == SessionState::Syncing {
            cursor.snapshot_landed = true;
            cursor.needs_resync = false;
            self.outbound().clear();
        }
    }

    /// Turn queued mutations into numbered `Diff` frames, or perform a
    /// scheduled resync.
    pub fn poll_outbound<D: Document + ?Sized>(&self, document: &D) -> Vec<Frame> {
        let mut cursor = self.cursor();
        if cursor.needs_resync && cursor.state != SessionState::Closed {
            cursor.needs_resync = false;
            drop(cursor);
            return self.resync(document, "outbound overflow");
        }
        if cursor.state != SessionState::Active {
            return Vec::new();
        }

        let drained = self.outbound().drain();
        let mut frames = Vec::with_capacity(drained.len());
        for tagged in drained {
            let seq = cursor.last_sent.wrapping_add(1);
            match Frame::diff(seq, &tagged.mutation) {
                Ok(frame) => {
                    cursor.last_sent = seq;
                    frames.push(frame);
                }
                Err(e) => {
                    log::error!("session {}: cannot encode {}: {e}", self.id, tagged.mutation);
                    drop(cursor);
                    return self.resync(document, "encode failure");
                }
            }
        }
        self.stats
            .diffs_sent
            .fetch_add(frames.len() as u64, Ordering::Relaxed);
        frames
    }

    /// Handle one inbound frame; returns the frames to send in reply.
    pub fn receive<D: Document + ?Sized>(&self, document: &D, frame: &Frame) -> Vec<Frame> {
        bump(&self.stats.frames_received);
        if self.is_closed() {
            return Vec::new();
        }

        match (frame.kind, self.role) {
            (FrameKind::Diff, _) => self.receive_diff(document, frame),
            (FrameKind::Snapshot, SessionRole::Client) => self.apply_snapshot(document, frame),
            (FrameKind::SnapshotRequest, SessionRole::Server) => {
                self.resync(document, "peer requested snapshot")
            }
            (FrameKind::SnapshotAck, SessionRole::Server) => self.acknowledge(document, frame.seq),
            (FrameKind::Ping, _) => vec![Frame::pong()],
            (FrameKind::Pong, _) => Vec::new(),
            (kind, role) => {
                log::debug!("session {} ({role:?}) ignoring {kind:?} frame", self.id);
                Vec::new()
            }
        }
    }

    /// Drop queued output and start over from a fresh snapshot.
    pub fn request_resync<D: Document + ?Sized>(&self, document: &D) -> Vec<Frame> {
        self.resync(document, "requested by owner")
    }

    /// Discard everything queued and stop accepting mutations.
    pub fn close(&self) {
        let mut cursor = self.cursor();
        if cursor.state == SessionState::Closed {
            return;
        }
        cursor.state = SessionState::Closed;
        let dropped = {
            let mut outbound = self.outbound();
            let n = outbound.len();
            outbound.clear();
            n
        };
        drop(cursor);
        if dropped > 0 {
            log::debug!("session {} closed, dropped {dropped} queued mutations", self.id);
        }
        self.wake.notify_one();
    }

    fn receive_diff<D: Document + ?Sized>(&self, document: &D, frame: &Frame) -> Vec<Frame> {
        {
            let cursor = self.cursor();
            if cursor.state != SessionState::Active {
                log::trace!("session {} discarding diff {} while {}", self.id, frame.seq, cursor.state);
                return Vec::new();
            }
            let expected = cursor.last_applied.wrapping_add(1);
            if frame.seq != expected {
                drop(cursor);
                log::warn!(
                    "session {}: expected diff {expected}, got {}; resyncing",
                    self.id,
                    frame.seq
                );
                return self.resync(document, "sequence gap");
            }
        }

        let mutation = match frame.mutation() {
            Ok(m) => m,
            Err(e) => {
                bump(&self.stats.decode_errors);
                log::warn!("session {}: undecodable diff {}: {e}", self.id, frame.seq);
                return self.resync(document, "decode error");
            }
        };
        if let Err(e) = self.source.apply_to(document, &mutation) {
            bump(&self.stats.apply_errors);
            log::warn!("session {}: cannot apply {mutation}: {e}", self.id);
            return self.resync(document, "apply error");
        }

        let mut cursor = self.cursor();
        if cursor.state == SessionState::Active {
            cursor.last_applied = frame.seq;
        }
        bump(&self.stats.diffs_applied);
        Vec::new()
    }

    fn apply_snapshot<D: Document + ?Sized>(&self, document: &D, frame: &Frame) -> Vec<Frame> {
        let mutations = match frame.mutations() {
            Ok(m) => m,
            Err(e) => {
                bump(&self.stats.decode_errors);
                log::warn!("session {}: undecodable snapshot: {e}", self.id);
                return self.resync(document, "decode error");
            }
        };

        {
            let mut cursor = self.cursor();
            if cursor.state == SessionState::Closed {
                return Vec::new();
            }
            cursor.state = SessionState::Syncing;
            cursor.snapshot_landed = false;
            self.outbound().clear();
        }

        for mutation in &mutations {
            if let Err(e) = self.source.apply_to(document, mutation) {
                bump(&self.stats.apply_errors);
                log::warn!("session {}: snapshot entry {mutation} failed: {e}", self.id);
                return self.resync(document, "apply error");
            }
        }

        // An unchanged snapshot never reaches `offer`, so edits queued
        // meanwhile cannot be ordered against it.
        let raced = {
            let mut cursor = self.cursor();
            if cursor.state == SessionState::Closed {
                return Vec::new();
            }
            let raced = !cursor.snapshot_landed && !self.outbound().is_empty();
            if !raced {
                cursor.state = SessionState::Active;
                cursor.last_applied = 0;
                cursor.last_sent = 0;
                cursor.missed = false;
            }
            raced
        };
        if raced {
            return self.resync(document, "local edits raced an unchanged snapshot");
        }

        bump(&self.stats.snapshots_applied);
        log::debug!(
            "session {} applied snapshot {} of {} mutations",
            self.id,
            frame.seq,
            mutations.len()
        );
        if self.pending() > 0 {
            self.wake.notify_one();
        }
        vec![Frame::snapshot_ack(frame.seq)]
    }

    fn acknowledge<D: Document + ?Sized>(&self, document: &D, generation: u32) -> Vec<Frame> {
        let mut cursor = self.cursor();
        if cursor.state != SessionState::Syncing {
            return Vec::new();
        }
        if generation != cursor.snapshot_generation {
            log::trace!(
                "session {} ignoring ack of snapshot {generation}, waiting for {}",
                self.id,
                cursor.snapshot_generation
            );
            return Vec::new();
        }
        if cursor.missed {
            drop(cursor);
            log::debug!("session {} missed mutations while syncing, sending another snapshot", self.id);
            return self.send_snapshot(document);
        }
        cursor.state = SessionState::Active;
        drop(cursor);
        log::debug!("session {} active", self.id);
        Vec::new()
    }

    fn resync<D: Document + ?Sized>(&self, document: &D, reason: &str) -> Vec<Frame> {
        bump(&self.stats.resyncs);
        log::info!("session {} resyncing: {reason}", self.id);
        match self.role {
            SessionRole::Server => self.send_snapshot(document),
            SessionRole::Client => {
                let mut cursor = self.cursor();
                if cursor.state == SessionState::Closed {
                    return Vec::new();
                }
                cursor.state = SessionState::Syncing;
                cursor.needs_resync = false;
                self.outbound().clear();
                vec![Frame::snapshot_request()]
            }
        }
    }

    /// Server side: enter `Syncing` and capture the document. Capture
    /// happens with no session lock held.
    fn send_snapshot<D: Document + ?Sized>(&self, document: &D) -> Vec<Frame> {
        let generation = {
            let mut cursor = self.cursor();
            if cursor.state == SessionState::Closed {
                return Vec::new();
            }
            cursor.state = SessionState::Syncing;
            cursor.last_applied = 0;
            cursor.last_sent = 0;
            cursor.missed = false;
            cursor.needs_resync = false;
            cursor.snapshot_generation = cursor.snapshot_generation.wrapping_add(1);
            self.outbound().clear();
            cursor.snapshot_generation
        };

        let snapshot: Vec<Mutation> = document.current_snapshot();
        match Frame::snapshot(generation, &snapshot) {
            Ok(frame) => {
                bump(&self.stats.snapshots_sent);
                vec![frame]
            }
            Err(e) => {
                log::error!("session {}: cannot encode snapshot: {e}", self.id);
                Vec::new()
            }
        }
    }
}

impl fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use strata_core::{
        ApplyError, Change, MutationCallback, Node, NodePath, Origin, Subscription, Tree, Value,
    };

    struct Side {
        tree: Arc<Tree>,
        session: Arc<SyncSession>,
        _sub: Subscription,
    }

    fn side(tree: Tree, role: SessionRole, id: SessionId, capacity: usize) -> Side {
        let tree = Arc::new(tree);
        let session = Arc::new(SyncSession::new(id, role, SyncMode::Bidirectional, capacity));
        let offered = session.clone();
        let sub = tree.on_mutation(Arc::new(move |t: &TaggedMutation| {
            offered.offer(t);
        }));
        Side {
            tree,
            session,
            _sub: sub,
        }
    }

    fn deliver(to: &Side, frames: Vec<Frame>) -> Vec<Frame> {
        frames
            .iter()
            .flat_map(|f| to.session.receive(to.tree.as_ref(), f))
            .collect()
    }

    /// Run the handshake-free part of a session until both ends settle.
    fn connected_pair(capacity: usize) -> (Side, Side) {
        let id = SessionId::new();
        let server = side(
            Tree::from_root(Node::new("root").with_child(Node::new("a").with_property("x", 0))),
            SessionRole::Server,
            id,
            capacity,
        );
        let client = side(Tree::new("empty"), SessionRole::Client, id, capacity);

        assert!(client.session.start(client.tree.as_ref()).is_empty());
        let snapshot = server.session.start(server.tree.as_ref());
        assert_eq!(snapshot[0].kind, FrameKind::Snapshot);
        let ack = deliver(&client, snapshot);
        assert_eq!(ack, vec![Frame::snapshot_ack(1)]);
        assert!(deliver(&server, ack).is_empty());

        assert!(server.session.is_active());
        assert!(client.session.is_active());
        (server, client)
    }

    #[test]
    fn test_snapshot_establishes_baseline() {
        let (server, client) = connected_pair(64);
        assert_eq!(client.tree.root(), server.tree.root());
        assert_eq!(client.session.last_applied(), 0);
        assert_eq!(server.session.stats().snapshots_sent, 1);
        assert_eq!(client.session.stats().snapshots_applied, 1);
    }

    #[test]
    fn test_diffs_flow_both_ways_without_echo() {
        let (server, client) = connected_pair(64);
        let a = NodePath::root().child(0);

        server.tree.set_property(&a, "x", 5).unwrap();
        let diffs = server.session.poll_outbound(server.tree.as_ref());
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].seq, 1);
        deliver(&client, diffs);
        assert_eq!(client.tree.property(&a, "x"), Some(Value::Int(5)));
        // The applied diff must not be queued back toward the server.
        assert_eq!(client.session.pending(), 0);
        assert!(client.session.poll_outbound(client.tree.as_ref()).is_empty());

        client.tree.set_property(&a, "y", "hello").unwrap();
        let diffs = client.session.poll_outbound(client.tree.as_ref());
        assert_eq!(diffs[0].seq, 1);
        deliver(&server, diffs);
        assert_eq!(server.tree.property(&a, "y"), Some(Value::from("hello")));
        assert_eq!(server.session.pending(), 0);
        assert_eq!(server.session.last_applied(), 1);
    }

    #[test]
    fn test_sequence_gap_triggers_snapshot_request() {
        let (server, client) = connected_pair(64);
        let a = NodePath::root().child(0);

        for v in 1..=3 {
            server.tree.add_child(&a, 0, Node::new(format!("n{v}"))).unwrap();
        }
        let diffs = server.session.poll_outbound(server.tree.as_ref());
        assert_eq!(diffs.len(), 3);

        deliver(&client, vec![diffs[0].clone()]);
        let reply = deliver(&client, vec![diffs[2].clone()]);
        assert_eq!(reply, vec![Frame::snapshot_request()]);
        assert_eq!(client.session.state(), SessionState::Syncing);

        // Diffs arriving while syncing are dropped, not applied.
        assert!(deliver(&client, vec![diffs[1].clone()]).is_empty());
        assert_eq!(client.session.last_applied(), 1);

        let snapshot = deliver(&server, reply);
        assert_eq!(snapshot[0].kind, FrameKind::Snapshot);
        deliver(&server, deliver(&client, snapshot));
        assert!(client.session.is_active());
        assert!(server.session.is_active());
        assert_eq!(client.tree.root(), server.tree.root());
    }

    #[test]
    fn test_undecodable_diff_resyncs() {
        let (_server, client) = connected_pair(64);
        let bad = Frame {
            kind: FrameKind::Diff,
            seq: 1,
            payload: vec![0x09, 1, 2],
        };
        assert_eq!(deliver(&client, vec![bad]), vec![Frame::snapshot_request()]);
        assert_eq!(client.session.stats().decode_errors, 1);
    }

    #[test]
    fn test_undecodable_snapshot_recovers() {
        let id = SessionId::new();
        let server = side(
            Tree::from_root(Node::new("root").with_child(Node::new("a"))),
            SessionRole::Server,
            id,
            64,
        );
        let client = side(Tree::new("empty"), SessionRole::Client, id, 64);
        client.session.start(client.tree.as_ref());

        let mut first = server.session.start(server.tree.as_ref());
        first[0].payload.clear();
        let reply = deliver(&client, first);
        assert_eq!(reply, vec![Frame::snapshot_request()]);
        assert_eq!(client.session.stats().decode_errors, 1);

        let second = deliver(&server, reply);
        assert_eq!(second[0].kind, FrameKind::Snapshot);
        assert_eq!(second[0].seq, 2);
        let ack = deliver(&client, second);
        assert_eq!(ack, vec![Frame::snapshot_ack(2)]);
        assert!(deliver(&server, ack).is_empty());
        assert!(server.session.is_active());
        assert!(client.session.is_active());
        assert_eq!(client.tree.root(), server.tree.root());

        // Incremental diffs flow again in both directions.
        let a = NodePath::root().child(0);
        server.tree.set_property(&a, "x", 7).unwrap();
        deliver(&client, server.session.poll_outbound(server.tree.as_ref()));
        assert_eq!(client.tree.property(&a, "x"), Some(Value::Int(7)));
        client.tree.set_property(&a, "y", 8).unwrap();
        deliver(&server, client.session.poll_outbound(client.tree.as_ref()));
        assert_eq!(server.tree.property(&a, "y"), Some(Value::Int(8)));
    }

    #[test]
    fn test_unappliable_snapshot_recovers() {
        let id = SessionId::new();
        let server = side(Tree::new("root"), SessionRole::Server, id, 64);
        let client = side(Tree::new("empty"), SessionRole::Client, id, 64);
        client.session.start(client.tree.as_ref());

        let first = server.session.start(server.tree.as_ref());
        let bad = Frame::snapshot(first[0].seq, &[Mutation::child_remove(NodePath::root(), 3)]).unwrap();
        let reply = deliver(&client, vec![bad]);
        assert_eq!(reply, vec![Frame::snapshot_request()]);
        assert_eq!(client.session.stats().apply_errors, 1);
        assert_eq!(client.session.state(), SessionState::Syncing);

        deliver(&server, deliver(&client, deliver(&server, reply)));
        assert!(server.session.is_active());
        assert!(client.session.is_active());
        assert_eq!(client.tree.root(), server.tree.root());
    }

    #[test]
    fn test_ack_of_superseded_snapshot_is_ignored() {
        let (server, client) = connected_pair(64);
        let second = server.session.request_resync(server.tree.as_ref());
        let third = deliver(&server, vec![Frame::snapshot_request()]);
        assert_eq!((second[0].seq, third[0].seq), (2, 3));

        let stale = deliver(&client, second);
        assert_eq!(stale, vec![Frame::snapshot_ack(2)]);
        assert!(deliver(&server, stale).is_empty());
        assert_eq!(server.session.state(), SessionState::Syncing);

        deliver(&server, deliver(&client, third));
        assert!(server.session.is_active());
    }

    /// Makes one local edit on the wrapped tree right after it applies a
    /// subtree replacement, before the applying call returns.
    struct EditAfterReplace {
        tree: Arc<Tree>,
        armed: AtomicBool,
    }

    impl Document for EditAfterReplace {
        fn current_snapshot(&self) -> Vec<Mutation> {
            self.tree.current_snapshot()
        }

        fn apply(&self, mutation: &Mutation, origin: Origin) -> Result<(), ApplyError> {
            self.tree.apply(mutation, origin)?;
            let replaced = matches!(mutation.change, Change::SubtreeReplace { .. });
            if replaced && self.armed.swap(false, Ordering::SeqCst) {
                self.tree.set_property(&NodePath::root(), "late", 1)?;
            }
            Ok(())
        }

        fn on_mutation(&self, callback: MutationCallback) -> Subscription {
            self.tree.on_mutation(callback)
        }
    }

    #[test]
    fn test_edit_right_after_snapshot_is_sent() {
        let id = SessionId::new();
        let server = side(
            Tree::from_root(Node::new("root").with_child(Node::new("a"))),
            SessionRole::Server,
            id,
            64,
        );
        let client = side(Tree::new("empty"), SessionRole::Client, id, 64);
        let racing = EditAfterReplace {
            tree: client.tree.clone(),
            armed: AtomicBool::new(true),
        };
        client.session.start(&racing);

        let snapshot = server.session.start(server.tree.as_ref());
        let ack: Vec<Frame> = snapshot
            .iter()
            .flat_map(|f| client.session.receive(&racing, f))
            .collect();
        assert_eq!(ack, vec![Frame::snapshot_ack(1)]);
        assert!(client.session.is_active());
        assert_eq!(client.session.pending(), 1);
        deliver(&server, ack);

        let diffs = client.session.poll_outbound(&racing);
        assert_eq!(diffs.len(), 1);
        deliver(&server, diffs);
        assert_eq!(server.tree.property(&NodePath::root(), "late"), Some(Value::Int(1)));
        assert_eq!(client.tree.root(), server.tree.root());
    }

    #[test]
    fn test_edits_before_snapshot_are_dropped() {
        let (server, client) = connected_pair(64);
        let a = NodePath::root().child(0);
        let request = client.session.request_resync(client.tree.as_ref());
        client.tree.set_property(&a, "stale", true).unwrap();
        assert_eq!(client.session.pending(), 1);

        let ack = deliver(&client, deliver(&server, request));
        assert_eq!(ack, vec![Frame::snapshot_ack(2)]);
        assert_eq!(client.session.pending(), 0);
        deliver(&server, ack);

        assert!(server.session.is_active());
        assert!(client.session.is_active());
        assert_eq!(client.tree.property(&a, "stale"), None);
        assert_eq!(client.tree.root(), server.tree.root());
    }

    #[test]
    fn test_unchanged_snapshot_with_queued_edits_resyncs() {
        let (server, client) = connected_pair(64);
        let a = NodePath::root().child(0);
        server.tree.set_property(&a, "y", 1).unwrap();
        let request = client.session.request_resync(client.tree.as_ref());
        client.tree.set_property(&a, "y", 1).unwrap();

        // The snapshot already holds the queued edit, so it changes nothing.
        let reply = deliver(&client, deliver(&server, request));
        assert_eq!(reply, vec![Frame::snapshot_request()]);
        assert_eq!(client.session.pending(), 0);

        let ack = deliver(&client, deliver(&server, reply));
        assert_eq!(ack, vec![Frame::snapshot_ack(3)]);
        deliver(&server, ack);
        assert!(server.session.is_active());
        assert!(client.session.is_active());
        assert_eq!(client.tree.root(), server.tree.root());
    }

    #[test]
    fn test_forced_source_reports_unchanged_diff() {
        let (server, client) = connected_pair(64);
        let a = NodePath::root().child(0);
        let seen = Arc::new(std::sync::Mutex::new(0usize));
        let counter = seen.clone();
        let _watch = client.tree.on_mutation(Arc::new(move |_: &TaggedMutation| {
            *counter.lock().unwrap() += 1;
        }));

        let unchanged_write = || {
            let _force = server.tree.update_source().scoped_force();
            server.tree.set_property(&a, "x", 0).unwrap();
            server.session.poll_outbound(server.tree.as_ref())
        };

        deliver(&client, unchanged_write());
        assert_eq!(*seen.lock().unwrap(), 0);

        {
            let _force = client.session.update_source().scoped_force();
            deliver(&client, unchanged_write());
        }
        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(client.session.last_applied(), 2);
        assert_eq!(client.session.pending(), 0);
    }

    #[test]
    fn test_rejected_apply_resyncs_and_leaves_tree() {
        let (server, client) = connected_pair(64);
        let before = server.tree.root();
        let bad = Frame::diff(1, &Mutation::child_remove(NodePath::root(), 99)).unwrap();

        let reply = deliver(&server, vec![bad]);
        assert_eq!(reply[0].kind, FrameKind::Snapshot);
        assert_eq!(server.tree.root(), before);
        assert_eq!(server.session.stats().apply_errors, 1);
        assert_eq!(server.session.state(), SessionState::Syncing);
        drop(client);
    }

    #[test]
    fn test_mutation_during_sync_forces_second_snapshot() {
        let id = SessionId::new();
        let server = side(Tree::new("root"), SessionRole::Server, id, 64);
        let client = side(Tree::new("empty"), SessionRole::Client, id, 64);
        client.session.start(client.tree.as_ref());

        let first = server.session.start(server.tree.as_ref());
        server.tree.set_property(&NodePath::root(), "late", true).unwrap();
        assert_eq!(server.session.stats().deferred, 1);

        let ack = deliver(&client, first);
        let second = deliver(&server, ack);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].kind, FrameKind::Snapshot);
        assert_eq!(server.session.state(), SessionState::Syncing);

        deliver(&server, deliver(&client, second));
        assert!(server.session.is_active());
        assert_eq!(client.tree.property(&NodePath::root(), "late"), Some(Value::Bool(true)));
    }

    #[test]
    fn test_overflow_schedules_resync() {
        let (server, _client) = connected_pair(2);
        for i in 0..3 {
            server
                .tree
                .set_property(&NodePath::root(), format!("p{i}"), i as i64)
                .unwrap();
        }
        let frames = server.session.poll_outbound(server.tree.as_ref());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Snapshot);
        assert_eq!(server.session.pending(), 0);
        assert_eq!(server.session.stats().resyncs, 1);
    }

    #[test]
    fn test_resync_is_idempotent_on_synced_replicas() {
        let (server, client) = connected_pair(64);
        let seen = Arc::new(std::sync::Mutex::new(0usize));
        let counter = seen.clone();
        let _watch = client.tree.on_mutation(Arc::new(move |_: &TaggedMutation| {
            *counter.lock().unwrap() += 1;
        }));
        let before = client.tree.root();

        let snapshot = server.session.request_resync(server.tree.as_ref());
        deliver(&server, deliver(&client, snapshot));

        assert_eq!(*seen.lock().unwrap(), 0);
        assert_eq!(client.tree.root(), before);
        assert!(server.session.is_active());
    }

    #[test]
    fn test_receive_only_client_never_queues() {
        let id = SessionId::new();
        let session = SyncSession::new(id, SessionRole::Client, SyncMode::ReceiveOnly, 16);
        let tagged = TaggedMutation::local(Mutation::child_remove(NodePath::root(), 0));
        assert_eq!(session.offer(&tagged), Offer::Suppressed);
    }

    #[test]
    fn test_own_origin_suppressed_others_queued() {
        let (server, _client) = connected_pair(16);
        let own = TaggedMutation::new(
            Mutation::child_remove(NodePath::root(), 0),
            Origin::Remote(server.session.id()),
        );
        let other = TaggedMutation::new(
            Mutation::child_remove(NodePath::root(), 0),
            Origin::Remote(SessionId::new()),
        );
        assert_eq!(server.session.offer(&own), Offer::Suppressed);
        assert_eq!(server.session.offer(&other), Offer::Queued);
    }

    #[test]
    fn test_ping_answered_and_close_is_final() {
        let (server, _client) = connected_pair(16);
        assert_eq!(deliver(&server, vec![Frame::ping()]), vec![Frame::pong()]);

        server.tree.set_property(&NodePath::root(), "k", 1).unwrap();
        server.session.close();
        assert_eq!(server.session.pending(), 0);
        let tagged = TaggedMutation::local(Mutation::child_remove(NodePath::root(), 0));
        assert_eq!(server.session.offer(&tagged), Offer::Closed);
        assert!(server.session.poll_outbound(server.tree.as_ref()).is_empty());
        assert!(deliver(&server, vec![Frame::ping()]).is_empty());
    }

    #[tokio::test]
    async fn test_offer_wakes_writer() {
        let (server, _client) = connected_pair(16);
        let session = server.session.clone();
        let waiter = tokio::spawn(async move { session.outbound_ready().await });
        server.tree.set_property(&NodePath::root(), "k", 1).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
