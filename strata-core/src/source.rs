//! Origin tagging for anything that emits mutations.
//!
//! A document owns a `Local` source for its own edit API; each sync
//! session owns a `Remote(session)` source it applies inbound mutations
//! through. Listeners compare the origin carried on each
//! `TaggedMutation` against a source to tell its own changes apart.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::document::{ApplyError, Document};
use crate::mutation::{Mutation, Origin, SessionId, TaggedMutation};

#[derive(Debug)]
pub struct UpdateSource {
    origin: Origin,
    force_update: AtomicBool,
}

impl UpdateSource {
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            force_update: AtomicBool::new(false),
        }
    }

    pub fn local() -> Self {
        Self::new(Origin::Local)
    }

    pub fn remote(session: SessionId) -> Self {
        Self::new(Origin::Remote(session))
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn tag(&self, mutation: Mutation) -> TaggedMutation {
        TaggedMutation::new(mutation, self.origin)
    }

    /// True if `tagged` was emitted through this source.
    pub fn originated(&self, tagged: &TaggedMutation) -> bool {
        tagged.origin == self.origin
    }

    /// Apply `mutation` to `document` on behalf of this source, forced
    /// while [`should_force_update`](Self::should_force_update) is set.
    pub fn apply_to<D: Document + ?Sized>(
        &self,
        document: &D,
        mutation: &Mutation,
    ) -> Result<(), ApplyError> {
        if self.should_force_update() {
            document.apply_forced(mutation, self.origin)
        } else {
            document.apply(mutation, self.origin)
        }
    }

    /// When set, setting a property to its current value still emits a
    /// mutation.
    pub fn force_update(&self, should_force: bool) {
        self.force_update.store(should_force, Ordering::SeqCst);
    }

    pub fn should_force_update(&self) -> bool {
        self.force_update.load(Ordering::SeqCst)
    }

    /// Force updates until the returned guard is dropped.
    pub fn scoped_force(&self) -> ScopedForceUpdate<'_> {
        let previous = self.force_update.swap(true, Ordering::SeqCst);
        ScopedForceUpdate {
            source: self,
            previous,
        }
    }
}

impl Clone for UpdateSource {
    fn clone(&self) -> Self {
        Self {
            origin: self.origin,
            force_update: AtomicBool::new(self.should_force_update()),
        }
    }
}

/// Restores the previous force-update flag on drop.
pub struct ScopedForceUpdate<'a> {
    source: &'a UpdateSource,
    previous: bool,
}

impl Drop for ScopedForceUpdate<'_> {
    fn drop(&mut self) {
        self.source.force_update(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::path::NodePath;
    use crate::tree::Tree;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_tag_carries_origin() {
        let session = SessionId::new();
        let source = UpdateSource::remote(session);
        let tagged = source.tag(Mutation::child_remove(NodePath::root(), 0));
        assert_eq!(tagged.origin, Origin::Remote(session));
        assert!(source.originated(&tagged));
        assert!(!UpdateSource::local().originated(&tagged));
        assert!(!UpdateSource::remote(SessionId::new()).originated(&tagged));
    }

    #[test]
    fn test_scoped_force_restores_previous() {
        let source = UpdateSource::local();
        assert!(!source.should_force_update());
        {
            let _guard = source.scoped_force();
            assert!(source.should_force_update());
        }
        assert!(!source.should_force_update());

        source.force_update(true);
        {
            let _guard = source.scoped_force();
        }
        assert!(source.should_force_update());
    }

    #[test]
    fn test_apply_to_honours_force() {
        let tree = Tree::from_root(Node::new("root").with_property("x", 1));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _sub = tree.on_mutation(Arc::new(move |_: &TaggedMutation| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let source = UpdateSource::remote(SessionId::new());
        let same = Mutation::property_set(NodePath::root(), "x", 1);
        source.apply_to(&tree, &same).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        {
            let _guard = source.scoped_force();
            source.apply_to(&tree, &same).unwrap();
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // The tree's own flag does not leak into remote applies.
        tree.update_source().force_update(true);
        source.apply_to(&tree, &same).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
