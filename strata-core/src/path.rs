//! Index-based addressing from the document root to a node.
//!
//! A path is the sequence of child indices walked from the root, so it
//! preserves the order of the route and encodes in a handful of bytes.
//! Rendered form: `/` for the root, `/0/2/1` for deeper nodes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodePath(Vec<u32>);

impl NodePath {
    /// The document root.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn from_indices(indices: impl Into<Vec<u32>>) -> Self {
        Self(indices.into())
    }

    /// Path of the `index`th child of this node.
    pub fn child(&self, index: u32) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }

    /// Path of the parent node, `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// Index of this node within its parent, `None` for the root.
    pub fn last_index(&self) -> Option<u32> {
        self.0.last().copied()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn indices(&self) -> &[u32] {
        &self.0
    }

    /// True if `self` is `other` or lies beneath it.
    pub fn starts_with(&self, other: &NodePath) -> bool {
        self.0.starts_with(&other.0)
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for index in &self.0 {
            write!(f, "/{index}")?;
        }
        Ok(())
    }
}

/// Error returned when parsing a rendered path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid node path {input:?}: {reason}")]
pub struct ParsePathError {
    pub input: String,
    pub reason: &'static str,
}

impl FromStr for NodePath {
    type Err = ParsePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix('/').ok_or_else(|| ParsePathError {
            input: s.to_string(),
            reason: "must start with '/'",
        })?;
        if rest.is_empty() {
            return Ok(Self::root());
        }
        rest.split('/')
            .map(|segment| {
                segment.parse::<u32>().map_err(|_| ParsePathError {
                    input: s.to_string(),
                    reason: "segments must be child indices",
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}
