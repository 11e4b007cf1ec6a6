//! Explicit registry of mutation listeners with cancelable handles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::mutation::TaggedMutation;

/// Listener invoked once per applied mutation.
pub type MutationCallback = Arc<dyn Fn(&TaggedMutation) + Send + Sync>;

struct RegistryInner {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, MutationCallback)>>,
}

/// Set of listeners attached to one document.
pub struct SubscriberRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(1),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a listener. It stays registered until the returned
    /// handle is cancelled or dropped.
    pub fn subscribe(&self, callback: MutationCallback) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));
        Subscription {
            registry: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Deliver `tagged` to every listener in registration order.
    ///
    /// The registry lock is released before callbacks run, so a callback
    /// may cancel its own subscription.
    pub fn notify(&self, tagged: &TaggedMutation) {
        let callbacks: Vec<MutationCallback> = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(tagged);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a registered listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription immediately unsubscribes the listener"]
pub struct Subscription {
    registry: Weak<RegistryInner>,
    id: u64,
}

impl Subscription {
    /// Unsubscribe now.
    pub fn cancel(self) {}

    /// False once the listener has been removed or the document is gone.
    pub fn is_active(&self) -> bool {
        match self.registry.upgrade() {
            Some(inner) => inner
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .any(|(id, _)| *id == self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
