//! In-memory document tree.
//!
//! `Tree` is the reference `Document`: one mutex is the ordering point
//! for every mutation, local or remote, and listeners are notified while
//! it is held, so they observe mutations in exactly the order they were
//! applied.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::document::{ApplyError, Document};
use crate::mutation::{Change, Mutation, Origin, TaggedMutation};
use crate::node::Node;
use crate::path::NodePath;
use crate::source::UpdateSource;
use crate::subscription::{MutationCallback, SubscriberRegistry, Subscription};
use crate::value::Value;

pub struct Tree {
    root: Mutex<Node>,
    /// Source for edits made through this tree's own API
    source: UpdateSource,
    listeners: SubscriberRegistry,
}

impl Tree {
    /// Create a tree with an empty root of the given type.
    pub fn new(kind: impl Into<String>) -> Self {
        Self::from_root(Node::new(kind))
    }

    pub fn from_root(root: Node) -> Self {
        Self {
            root: Mutex::new(root),
            source: UpdateSource::local(),
            listeners: SubscriberRegistry::new(),
        }
    }

    /// The source local edits are tagged with; controls force-update.
    pub fn update_source(&self) -> &UpdateSource {
        &self.source
    }

    /// Copy of the whole tree.
    pub fn root(&self) -> Node {
        self.lock().clone()
    }

    pub fn node(&self, path: &NodePath) -> Option<Node> {
        self.lock().descendant(path).cloned()
    }

    pub fn property(&self, path: &NodePath, name: &str) -> Option<Value> {
        self.lock()
            .descendant(path)
            .and_then(|node| node.property(name).cloned())
    }

    pub fn child_count(&self, path: &NodePath) -> Option<usize> {
        self.lock().descendant(path).map(|node| node.children.len())
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn set_property(
        &self,
        path: &NodePath,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), ApplyError> {
        self.commit_local(&Mutation::property_set(path.clone(), name, value))
    }

    pub fn add_child(&self, path: &NodePath, index: u32, node: Node) -> Result<(), ApplyError> {
        self.commit_local(&Mutation::child_add(path.clone(), index, node))
    }

    /// Append `node` as the last child of `path`; returns its index.
    pub fn append_child(&self, path: &NodePath, node: Node) -> Result<u32, ApplyError> {
        let mut root = self.lock();
        let len = root
            .descendant(path)
            .ok_or_else(|| ApplyError::PathNotFound(path.clone()))?
            .children
            .len() as u32;
        let mutation = Mutation::child_add(path.clone(), len, node);
        let force = self.source.should_force_update();
        self.commit_locked(&mut root, &mutation, self.source.origin(), force)?;
        Ok(len)
    }

    pub fn remove_child(&self, path: &NodePath, index: u32) -> Result<(), ApplyError> {
        self.commit_local(&Mutation::child_remove(path.clone(), index))
    }

    pub fn move_child(&self, path: &NodePath, from: u32, to: u32) -> Result<(), ApplyError> {
        self.commit_local(&Mutation::child_move(path.clone(), from, to))
    }

    pub fn replace_subtree(&self, path: &NodePath, node: Node) -> Result<(), ApplyError> {
        self.commit_local(&Mutation::subtree_replace(path.clone(), node))
    }

    fn lock(&self) -> MutexGuard<'_, Node> {
        self.root.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit_local(&self, mutation: &Mutation) -> Result<(), ApplyError> {
        self.commit(mutation, self.source.origin(), self.source.should_force_update())
    }

    fn commit(&self, mutation: &Mutation, origin: Origin, force: bool) -> Result<(), ApplyError> {
        let mut root = self.lock();
        self.commit_locked(&mut root, mutation, origin, force)
    }

    fn commit_locked(
        &self,
        root: &mut Node,
        mutation: &Mutation,
        origin: Origin,
        force: bool,
    ) -> Result<(), ApplyError> {
        if apply_change(root, mutation, force)? {
            log::trace!("applied {mutation} ({origin:?})");
            self.listeners
                .notify(&TaggedMutation::new(mutation.clone(), origin));
        }
        Ok(())
    }
}

impl Document for Tree {
    fn current_snapshot(&self) -> Vec<Mutation> {
        vec![Mutation::subtree_replace(NodePath::root(), self.root())]
    }

    fn apply(&self, mutation: &Mutation, origin: Origin) -> Result<(), ApplyError> {
        self.commit(mutation, origin, false)
    }

    fn apply_forced(&self, mutation: &Mutation, origin: Origin) -> Result<(), ApplyError> {
        self.commit(mutation, origin, true)
    }

    fn on_mutation(&self, callback: MutationCallback) -> Subscription {
        self.listeners.subscribe(callback)
    }
}

/// Apply `mutation` to the tree rooted at `root`.
///
/// Every check happens before the first write. Returns `Ok(false)` when
/// the tree already matched and nothing changed.
fn apply_change(root: &mut Node, mutation: &Mutation, force: bool) -> Result<bool, ApplyError> {
    let path = &mutation.target;
    let target = root
        .descendant_mut(path)
        .ok_or_else(|| ApplyError::PathNotFound(path.clone()))?;

    let out_of_range = |index: u32, len: usize| ApplyError::IndexOutOfRange {
        path: path.clone(),
        index,
        len,
    };

    match &mutation.change {
        Change::PropertySet { name, value } => {
            let changed = target.set_property(name.as_str(), value.clone());
            Ok(changed || force)
        }
        Change::ChildAdd { index, node } => {
            let len = target.children.len();
            if *index as usize > len {
                return Err(out_of_range(*index, len));
            }
            target.children.insert(*index as usize, node.clone());
            Ok(true)
        }
        Change::ChildRemove { index } => {
            let len = target.children.len();
            if *index as usize >= len {
                return Err(out_of_range(*index, len));
            }
            target.children.remove(*index as usize);
            Ok(true)
        }
        Change::ChildMove { from, to } => {
            let len = target.children.len();
            if *from as usize >= len {
                return Err(out_of_range(*from, len));
            }
            if *to as usize >= len {
                return Err(out_of_range(*to, len));
            }
            if from == to {
                return Ok(false);
            }
            let child = target.children.remove(*from as usize);
            target.children.insert(*to as usize, child);
            Ok(true)
        }
        Change::SubtreeReplace { node } => {
            if *target == *node {
                return Ok(false);
            }
            *target = node.clone();
            Ok(true)
        }
    }
}
