//! Update Queue: ordered, coalescing buffer of pending mutations.
//!
//! Shared by every place that defers delivery: a session's outbound
//! buffer and the in-process mirror. Entries leave in arrival order.
//!
//! Coalescing only ever touches the tail: a `PropertySet` that overwrites
//! the same property of the same node as the last queued entry replaces
//! it. Structural mutations are never merged, and nothing is merged
//! across a structural entry, so replicas see structure change in the
//! same order the source did.

use std::collections::VecDeque;
use std::fmt;

use strata_core::TaggedMutation;

/// Predicate deciding which mutations a queue refuses.
pub type SuppressFn = Box<dyn Fn(&TaggedMutation) -> bool + Send + Sync>;

/// Outcome of [`UpdateQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Appended as a new entry
    Queued,
    /// Replaced the previous entry for the same property
    Coalesced,
    /// Rejected by a suppression predicate
    Suppressed,
    /// Rejected because the queue is at capacity
    Full,
}

impl Enqueued {
    /// True if the mutation will be delivered.
    pub fn accepted(self) -> bool {
        matches!(self, Enqueued::Queued | Enqueued::Coalesced)
    }
}

pub struct UpdateQueue {
    entries: VecDeque<TaggedMutation>,
    capacity: usize,
    suppressors: Vec<SuppressFn>,
    coalesced: u64,
}

impl UpdateQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            suppressors: Vec::new(),
            coalesced: 0,
        }
    }

    /// Builder form of [`suppress`](Self::suppress).
    pub fn with_suppressor(
        mut self,
        predicate: impl Fn(&TaggedMutation) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.suppress(predicate);
        self
    }

    /// Refuse every future mutation matching `predicate`, and drop any
    /// queued entries that match it.
    pub fn suppress(&mut self, predicate: impl Fn(&TaggedMutation) -> bool + Send + Sync + 'static) {
        self.entries.retain(|entry| !predicate(entry));
        self.suppressors.push(Box::new(predicate));
    }

    pub fn is_suppressed(&self, tagged: &TaggedMutation) -> bool {
        self.suppressors.iter().any(|p| p(tagged))
    }

    pub fn enqueue(&mut self, tagged: TaggedMutation) -> Enqueued {
        if self.is_suppressed(&tagged) {
            return Enqueued::Suppressed;
        }

        if let Some(tail) = self.entries.back_mut() {
            if tail.mutation.is_superseded_by(&tagged.mutation) {
                *tail = tagged;
                self.coalesced += 1;
                return Enqueued::Coalesced;
            }
        }

        if self.entries.len() >= self.capacity {
            return Enqueued::Full;
        }
        self.entries.push_back(tagged);
        Enqueued::Queued
    }

    /// Remove and return everything queued, oldest first.
    pub fn drain(&mut self) -> Vec<TaggedMutation> {
        self.entries.drain(..).collect()
    }

    pub fn pop_front(&mut self) -> Option<TaggedMutation> {
        self.entries.pop_front()
    }

    pub fn peek(&self) -> Option<&TaggedMutation> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discard all queued entries. Suppression predicates stay.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of mutations merged into an earlier entry so far.
    pub fn coalesced_count(&self) -> u64 {
        self.coalesced
    }
}

impl fmt::Debug for UpdateQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateQueue")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .field("suppressors", &self.suppressors.len())
            .field("coalesced", &self.coalesced)
            .finish()
    }
}
