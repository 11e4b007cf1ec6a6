//! # strata-core — Replicated document model
//!
//! The document side of the Strata replication engine: a tree of typed
//! nodes, the mutations that change it, and the narrow [`Document`]
//! interface the sync layer drives.
//!
//! ## Architecture
//!
//! ```text
//!   edit API ──┐                         ┌──► listener (session A)
//!              ├──► Tree ──[lock]──► notify ─► listener (session B)
//!   apply() ───┘     │                   └──► listener (controller)
//!                    ▼
//!             TaggedMutation { mutation, origin: Local | Remote(id) }
//! ```
//!
//! Every mutation, local or remote, passes the tree's single lock, and
//! listeners run inside it. That lock is the ordering point the sync
//! engine relies on.
//!
//! ## Modules
//!
//! - [`value`] — Scalar property values
//! - [`path`] — Root-to-node child index routes
//! - [`node`] — Tree nodes with stable ids
//! - [`mutation`] — Mutations, origins and session ids
//! - [`subscription`] — Listener registry with cancelable handles
//! - [`source`] — Origin tagging and force-update
//! - [`document`] — The `Document` trait
//! - [`tree`] — In-memory `Document` implementation

pub mod document;
pub mod mutation;
pub mod node;
pub mod path;
pub mod source;
pub mod subscription;
pub mod tree;
pub mod value;

pub use document::{ApplyError, Document};
pub use mutation::{Change, Mutation, MutationKind, Origin, SessionId, TaggedMutation};
pub use node::Node;
pub use path::{NodePath, ParsePathError};
pub use source::{ScopedForceUpdate, UpdateSource};
pub use subscription::{MutationCallback, SubscriberRegistry, Subscription};
pub use tree::Tree;
pub use value::{StatusCode, Value};
