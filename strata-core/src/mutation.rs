//! Mutations: immutable descriptions of one atomic document change.
//!
//! ```text
//! ┌────────────────┬─────────────────────────────────────────────┐
//! │ kind           │ payload                                     │
//! ├────────────────┼─────────────────────────────────────────────┤
//! │ PropertySet    │ name, value                                 │
//! │ ChildAdd       │ index, node (whole subtree, ids preserved)  │
//! │ ChildRemove    │ index                                       │
//! │ ChildMove      │ from index, to index                        │
//! │ SubtreeReplace │ node (whole subtree, ids preserved)         │
//! └────────────────┴─────────────────────────────────────────────┘
//! ```
//!
//! Every mutation names its `target` node by path. For child operations
//! the target is the parent whose child sequence changes.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::node::Node;
use crate::path::NodePath;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MutationKind {
    PropertySet = 1,
    ChildAdd = 2,
    ChildRemove = 3,
    ChildMove = 4,
    SubtreeReplace = 5,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    PropertySet { name: String, value: Value },
    ChildAdd { index: u32, node: Node },
    ChildRemove { index: u32 },
    ChildMove { from: u32, to: u32 },
    SubtreeReplace { node: Node },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub target: NodePath,
    pub change: Change,
}

impl Mutation {
    pub fn property_set(target: NodePath, name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            target,
            change: Change::PropertySet {
                name: name.into(),
                value: value.into(),
            },
        }
    }

    pub fn child_add(target: NodePath, index: u32, node: Node) -> Self {
        Self {
            target,
            change: Change::ChildAdd { index, node },
        }
    }

    pub fn child_remove(target: NodePath, index: u32) -> Self {
        Self {
            target,
            change: Change::ChildRemove { index },
        }
    }

    pub fn child_move(target: NodePath, from: u32, to: u32) -> Self {
        Self {
            target,
            change: Change::ChildMove { from, to },
        }
    }

    pub fn subtree_replace(target: NodePath, node: Node) -> Self {
        Self {
            target,
            change: Change::SubtreeReplace { node },
        }
    }

    pub fn kind(&self) -> MutationKind {
        match self.change {
            Change::PropertySet { .. } => MutationKind::PropertySet,
            Change::ChildAdd { .. } => MutationKind::ChildAdd,
            Change::ChildRemove { .. } => MutationKind::ChildRemove,
            Change::ChildMove { .. } => MutationKind::ChildMove,
            Change::SubtreeReplace { .. } => MutationKind::SubtreeReplace,
        }
    }

    /// Everything except `PropertySet` changes the shape of the tree.
    pub fn is_structural(&self) -> bool {
        self.kind() != MutationKind::PropertySet
    }

    /// Property name for `PropertySet`, `None` otherwise.
    pub fn property_name(&self) -> Option<&str> {
        match &self.change {
            Change::PropertySet { name, .. } => Some(name),
            _ => None,
        }
    }

    /// True if `later` overwrites the same property of the same node, so
    /// only `later` needs to reach a replica.
    pub fn is_superseded_by(&self, later: &Mutation) -> bool {
        match (self.property_name(), later.property_name()) {
            (Some(a), Some(b)) => a == b && self.target == later.target,
            _ => false,
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.change {
            Change::PropertySet { name, value } => {
                write!(f, "set {}.{name} = {value}", self.target)
            }
            Change::ChildAdd { index, node } => {
                write!(f, "add {}[{index}] <{}>", self.target, node.kind)
            }
            Change::ChildRemove { index } => write!(f, "remove {}[{index}]", self.target),
            Change::ChildMove { from, to } => {
                write!(f, "move {}[{from}] -> [{to}]", self.target)
            }
            Change::SubtreeReplace { node } => {
                write!(f, "replace {} <{}>", self.target, node.kind)
            }
        }
    }
}

/// Identity of one live sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a mutation came from. Never persisted or transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Made through the hosting application's own edit API
    Local,
    /// Applied on behalf of the given session
    Remote(SessionId),
}

impl Origin {
    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Local)
    }

    /// True if this mutation was delivered by `session`.
    pub fn is_from(&self, session: SessionId) -> bool {
        matches!(self, Origin::Remote(id) if *id == session)
    }
}

/// A mutation together with its origin, as seen by document listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedMutation {
    pub mutation: Mutation,
    pub origin: Origin,
}

impl TaggedMutation {
    pub fn new(mutation: Mutation, origin: Origin) -> Self {
        Self { mutation, origin }
    }

    pub fn local(mutation: Mutation) -> Self {
        Self::new(mutation, Origin::Local)
    }
}
