use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::path::NodePath;
use crate::value::Value;

/// One node of the document tree.
///
/// The `id` travels with the node through snapshots and `ChildAdd`
/// payloads, so a replica's node is the same logical node as the
/// original rather than a structurally-equal copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    /// Type tag
    pub kind: String,
    /// Properties in insertion order
    pub properties: Vec<(String, Value)>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(kind: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), kind)
    }

    /// Create with explicit id (for testing and replicas)
    pub fn with_id(id: Uuid, kind: impl Into<String>) -> Self {
        Self {
            id,
            kind: kind.into(),
            properties: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_property(name, value.into());
        self
    }

    /// Builder-style child append.
    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Set a property, keeping its original position if it already exists.
    ///
    /// Returns `true` if the stored value changed.
    pub fn set_property(&mut self, name: impl Into<String>, value: Value) -> bool {
        let name = name.into();
        match self.properties.iter_mut().find(|(key, _)| *key == name) {
            Some((_, existing)) if *existing == value => false,
            Some((_, existing)) => {
                *existing = value;
                true
            }
            None => {
                self.properties.push((name, value));
                true
            }
        }
    }

    pub fn child(&self, index: usize) -> Option<&Node> {
        self.children.get(index)
    }

    /// Walk `path` from this node.
    pub fn descendant(&self, path: &NodePath) -> Option<&Node> {
        path.indices()
            .iter()
            .try_fold(self, |node, &index| node.children.get(index as usize))
    }

    pub fn descendant_mut(&mut self, path: &NodePath) -> Option<&mut Node> {
        path.indices()
            .iter()
            .try_fold(self, |node, &index| node.children.get_mut(index as usize))
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(Node::node_count).sum::<usize>()
    }
}
