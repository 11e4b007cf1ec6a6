//! In-process one-way replication between two documents.
//!
//! A [`LocalSync`] listens to a producer document and queues what it sees;
//! the consumer's owner decides when to apply it with
//! [`perform_next_update`](LocalSync::perform_next_update) or
//! [`perform_all_updates`](LocalSync::perform_all_updates). Nothing crosses
//! a socket, but the rules are the same as for a network session: the
//! consumer first receives a snapshot, later mutations arrive in order,
//! and anything that cannot be applied or does not fit in the queue is
//! repaired with a fresh snapshot.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use strata_core::{
    ApplyError, Document, Mutation, Origin, SessionId, Subscription, TaggedMutation, UpdateSource,
};
use tokio::sync::Notify;

use crate::queue::{Enqueued, UpdateQueue};

/// Default bound on queued mutations before the mirror falls back to a
/// snapshot.
pub const DEFAULT_MIRROR_CAPACITY: usize = 10_000;

struct MirrorState {
    queue: UpdateQueue,
    /// Next update must be a snapshot
    needs_snapshot: bool,
    /// A snapshot is being captured
    capturing: bool,
    /// A mutation arrived while capturing
    missed: bool,
}

struct Shared {
    state: Mutex<MirrorState>,
    notify: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, MirrorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observe(&self, tagged: &TaggedMutation) {
        let mut state = self.state();
        if state.capturing {
            state.missed = true;
            return;
        }
        if state.needs_snapshot {
            return;
        }
        match state.queue.enqueue(tagged.clone()) {
            Enqueued::Queued | Enqueued::Coalesced => {}
            Enqueued::Suppressed => return,
            Enqueued::Full => {
                log::warn!("mirror queue full, falling back to a snapshot");
                state.queue.clear();
                state.needs_snapshot = true;
            }
        }
        drop(state);
        self.notify.notify_one();
    }
}

/// One-way mirror from a producer document into a consumer document.
pub struct LocalSync {
    id: SessionId,
    producer: Arc<dyn Document>,
    consumer: Arc<dyn Document>,
    source: UpdateSource,
    shared: Arc<Shared>,
    _subscription: Subscription,
}

impl LocalSync {
    /// Mirror `producer` into `consumer`, starting with a snapshot.
    pub fn new(producer: Arc<dyn Document>, consumer: Arc<dyn Document>) -> Self {
        Self::build(producer, consumer, SessionId::new(), None, true)
    }

    /// Two mirrors keeping `a` and `b` in step. `b` starts as a copy of
    /// `a`. Mutations one mirror applies are suppressed by the other, so
    /// nothing bounces back.
    pub fn pair(a: Arc<dyn Document>, b: Arc<dyn Document>) -> (Self, Self) {
        let a_to_b = SessionId::new();
        let b_to_a = SessionId::new();
        let forward = Self::build(a.clone(), b.clone(), a_to_b, Some(b_to_a), true);
        let backward = Self::build(b, a, b_to_a, Some(a_to_b), false);
        (forward, backward)
    }

    fn build(
        producer: Arc<dyn Document>,
        consumer: Arc<dyn Document>,
        id: SessionId,
        peer: Option<SessionId>,
        initial_snapshot: bool,
    ) -> Self {
        let mut queue = UpdateQueue::new(DEFAULT_MIRROR_CAPACITY);
        if let Some(peer) = peer {
            queue.suppress(move |t| t.origin.is_from(peer));
        }
        let shared = Arc::new(Shared {
            state: Mutex::new(MirrorState {
                queue,
                needs_snapshot: initial_snapshot,
                capturing: false,
                missed: false,
            }),
            notify: Notify::new(),
        });
        if initial_snapshot {
            shared.notify.notify_one();
        }

        let observer = shared.clone();
        let subscription = producer.on_mutation(Arc::new(move |t: &TaggedMutation| observer.observe(t)));

        Self {
            id,
            producer,
            consumer,
            source: UpdateSource::remote(id),
            shared,
            _subscription: subscription,
        }
    }

    /// Origin attached to mutations this mirror applies.
    pub fn origin(&self) -> Origin {
        self.source.origin()
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn update_source(&self) -> &UpdateSource {
        &self.source
    }

    /// Queued updates; a pending snapshot counts as one.
    pub fn pending_update_count(&self) -> usize {
        let state = self.shared.state();
        state.queue.len() + usize::from(state.needs_snapshot)
    }

    /// Apply the oldest pending update. Returns `Ok(false)` when there was
    /// nothing to do. A failed apply schedules a snapshot and reports the
    /// error.
    pub fn perform_next_update(&self) -> Result<bool, ApplyError> {
        let next = {
            let mut state = self.shared.state();
            if state.needs_snapshot {
                None
            } else {
                match state.queue.pop_front() {
                    Some(tagged) => Some(tagged.mutation),
                    None => return Ok(false),
                }
            }
        };

        match next {
            Some(mutation) => {
                if let Err(e) = self.source.apply_to(self.consumer.as_ref(), &mutation) {
                    log::warn!("mirror {}: cannot apply {mutation}: {e}", self.id);
                    self.schedule_snapshot();
                    return Err(e);
                }
                Ok(true)
            }
            None => {
                self.apply_snapshot()?;
                Ok(true)
            }
        }
    }

    /// Apply everything pending; returns how many updates were applied.
    pub fn perform_all_updates(&self) -> Result<usize, ApplyError> {
        let mut applied = 0;
        while self.perform_next_update()? {
            applied += 1;
        }
        Ok(applied)
    }

    /// Wait until at least one update is pending.
    pub async fn wait_for_updates(&self) {
        loop {
            let notified = self.shared.notify.notified();
            if self.pending_update_count() > 0 {
                return;
            }
            notified.await;
        }
    }

    fn schedule_snapshot(&self) {
        let mut state = self.shared.state();
        state.queue.clear();
        state.needs_snapshot = true;
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Capture and apply a snapshot. Capture repeats while the producer
    /// keeps changing underneath it, since a mutation seen during capture
    /// may or may not be part of it.
    fn apply_snapshot(&self) -> Result<(), ApplyError> {
        let snapshot: Vec<Mutation> = loop {
            {
                let mut state = self.shared.state();
                state.queue.clear();
                state.capturing = true;
                state.missed = false;
            }
            let snapshot = self.producer.current_snapshot();
            let mut state = self.shared.state();
            state.capturing = false;
            if !state.missed {
                state.needs_snapshot = false;
                break snapshot;
            }
        };

        for mutation in &snapshot {
            if let Err(e) = self.source.apply_to(self.consumer.as_ref(), mutation) {
                log::warn!("mirror {}: snapshot entry {mutation} failed: {e}", self.id);
                self.schedule_snapshot();
                return Err(e);
            }
        }
        log::debug!("mirror {} applied snapshot of {} mutations", self.id, snapshot.len());
        Ok(())
    }
}

impl std::fmt::Debug for LocalSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSync")
            .field("id", &self.id)
            .field("pending", &self.pending_update_count())
            .finish()
    }
}
