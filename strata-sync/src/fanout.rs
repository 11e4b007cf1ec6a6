//! Server-side fan-out of document mutations to every connected session.
//!
//! Every mutation is offered to every session; each session decides on
//! its own whether to queue it, suppress it (it delivered the mutation
//! itself) or defer it (it is still syncing). No async lock is taken, so
//! fan-out can run inside the document's notification callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use strata_core::{SessionId, TaggedMutation};

use crate::session::{Offer, SyncSession};

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutStats {
    /// Mutations offered to the group
    pub mutations: u64,
    /// Per-session deliveries (queued or coalesced)
    pub delivered: u64,
    /// Per-session no-echo suppressions
    pub suppressed: u64,
    /// Per-session deferrals to the next snapshot
    pub deferred: u64,
    /// Per-session queue overflows
    pub overflows: u64,
    pub sessions: usize,
}

/// Result of offering one mutation to the whole group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: usize,
    pub suppressed: usize,
    pub deferred: usize,
    pub overflowed: usize,
}

#[derive(Default)]
struct AtomicFanOutStats {
    mutations: AtomicU64,
    delivered: AtomicU64,
    suppressed: AtomicU64,
    deferred: AtomicU64,
    overflows: AtomicU64,
}

/// Registry of live sessions sharing one document.
#[derive(Default)]
pub struct FanOut {
    sessions: RwLock<HashMap<SessionId, Arc<SyncSession>>>,
    stats: AtomicFanOutStats,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Arc<SyncSession>) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id(), session);
    }

    /// Remove and close a session. Anything still queued for it is dropped.
    pub fn remove(&self, id: SessionId) -> Option<Arc<SyncSession>> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(session) = &removed {
            session.close();
        }
        removed
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<SyncSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.get(id).is_some()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Sessions currently in `Active`.
    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.is_active())
            .count()
    }

    /// Offer `tagged` to every session.
    pub fn fan_out(&self, tagged: &TaggedMutation) -> FanOutReport {
        let sessions: Vec<Arc<SyncSession>> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut report = FanOutReport::default();
        for session in sessions {
            match session.offer(tagged) {
                Offer::Queued | Offer::Coalesced => report.delivered += 1,
                Offer::Suppressed => report.suppressed += 1,
                Offer::Deferred => report.deferred += 1,
                Offer::Overflow => report.overflowed += 1,
                Offer::Closed => {}
            }
        }

        let s = &self.stats;
        s.mutations.fetch_add(1, Ordering::Relaxed);
        s.delivered.fetch_add(report.delivered as u64, Ordering::Relaxed);
        s.suppressed.fetch_add(report.suppressed as u64, Ordering::Relaxed);
        s.deferred.fetch_add(report.deferred as u64, Ordering::Relaxed);
        s.overflows.fetch_add(report.overflowed as u64, Ordering::Relaxed);
        report
    }

    /// Close and forget every session.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<SyncSession>> = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in &drained {
            session.close();
        }
        drained.len()
    }

    /// Lock-free counter snapshot.
    pub fn stats(&self) -> FanOutStats {
        let s = &self.stats;
        FanOutStats {
            mutations: s.mutations.load(Ordering::Relaxed),
            delivered: s.delivered.load(Ordering::Relaxed),
            suppressed: s.suppressed.load(Ordering::Relaxed),
            deferred: s.deferred.load(Ordering::Relaxed),
            overflows: s.overflows.load(Ordering::Relaxed),
            sessions: self.session_count(),
        }
    }
}
