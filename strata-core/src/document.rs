//! The narrow interface the sync engine needs from a document.

use crate::mutation::{Mutation, Origin};
use crate::path::NodePath;
use crate::subscription::{MutationCallback, Subscription};

/// A structurally valid mutation the document could not apply.
///
/// The document is left untouched when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("no node at path {0}")]
    PathNotFound(NodePath),

    #[error("child index {index} out of range for node at {path} ({len} children)")]
    IndexOutOfRange { path: NodePath, index: u32, len: usize },
}

/// A replicated, observable tree.
///
/// Implementations serialize every mutation through one ordering point
/// and notify listeners from inside it, in application order. Listeners
/// must not call back into the document.
pub trait Document: Send + Sync {
    /// Full state as mutations that rebuild it on an empty replica.
    fn current_snapshot(&self) -> Vec<Mutation>;

    /// Apply one mutation in full or not at all, tagging the resulting
    /// notification with `origin`.
    fn apply(&self, mutation: &Mutation, origin: Origin) -> Result<(), ApplyError>;

    /// Like [`apply`](Self::apply), but a write that leaves the document
    /// unchanged is still reported to listeners where the document can
    /// tell. Documents without that distinction apply normally.
    fn apply_forced(&self, mutation: &Mutation, origin: Origin) -> Result<(), ApplyError> {
        self.apply(mutation, origin)
    }

    /// Observe every mutation applied from now on.
    fn on_mutation(&self, callback: MutationCallback) -> Subscription;
}
