//! Sync Controller: one document, one transport, fixed role.
//!
//! ```text
//!   application edits ──► Document ──on_mutation──► SyncController
//!                            ▲                         │
//!                            │ apply (Remote origin)   ├─ server: Listener.fan_out()
//!                            │                         └─ client: Endpoint.push_local()
//!                       SyncSession(s) ◄── frames ── transport
//! ```
//!
//! The controller subscribes to the document at construction. Inbound
//! diffs reach the document through the sessions themselves, tagged with
//! their session's origin, so the same subscription sees them and the
//! per-session suppression keeps them from echoing back.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use strata_core::{Document, Subscription, TaggedMutation};

use crate::endpoint::{ConnectionEndpoint, EndpointConfig};
use crate::error::SyncError;
use crate::listener::{ConnectionListener, ListenerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRole {
    Server,
    Client,
}

impl fmt::Display for SyncRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncRole::Server => f.write_str("server"),
            SyncRole::Client => f.write_str("client"),
        }
    }
}

enum Transport {
    Listener(Arc<ConnectionListener>),
    Endpoint(Arc<ConnectionEndpoint>),
}

/// Owns the transport for one document and feeds it local mutations.
pub struct SyncController {
    document: Arc<dyn Document>,
    transport: Transport,
    subscription: Mutex<Option<Subscription>>,
}

impl SyncController {
    /// Serve `document` to connecting clients.
    pub fn server(document: Arc<dyn Document>, config: ListenerConfig) -> Self {
        let listener = Arc::new(ConnectionListener::new(document.clone(), config));
        let weak: Weak<ConnectionListener> = Arc::downgrade(&listener);
        let subscription = document.on_mutation(Arc::new(move |tagged: &TaggedMutation| {
            if let Some(listener) = weak.upgrade() {
                listener.fan_out(tagged);
            }
        }));
        Self {
            document,
            transport: Transport::Listener(listener),
            subscription: Mutex::new(Some(subscription)),
        }
    }

    /// Replicate `document` from a server.
    pub fn client(document: Arc<dyn Document>, config: EndpointConfig) -> Self {
        let endpoint = Arc::new(ConnectionEndpoint::new(document.clone(), config));
        let weak: Weak<ConnectionEndpoint> = Arc::downgrade(&endpoint);
        let subscription = document.on_mutation(Arc::new(move |tagged: &TaggedMutation| {
            if let Some(endpoint) = weak.upgrade() {
                endpoint.push_local(tagged);
            }
        }));
        Self {
            document,
            transport: Transport::Endpoint(endpoint),
            subscription: Mutex::new(Some(subscription)),
        }
    }

    pub fn role(&self) -> SyncRole {
        match self.transport {
            Transport::Listener(_) => SyncRole::Server,
            Transport::Endpoint(_) => SyncRole::Client,
        }
    }

    /// Bind (server) or connect (client). A server's bound address is
    /// available from [`listener`](Self::listener) afterwards.
    pub async fn start(&self, address: &str) -> Result<(), SyncError> {
        match &self.transport {
            Transport::Listener(listener) => {
                listener.start(address).await?;
            }
            Transport::Endpoint(endpoint) => {
                endpoint.connect(address).await?;
            }
        }
        log::info!("{} controller started on {address}", self.role());
        Ok(())
    }

    pub fn listener(&self) -> Option<&Arc<ConnectionListener>> {
        match &self.transport {
            Transport::Listener(listener) => Some(listener),
            Transport::Endpoint(_) => None,
        }
    }

    pub fn endpoint(&self) -> Option<&Arc<ConnectionEndpoint>> {
        match &self.transport {
            Transport::Endpoint(endpoint) => Some(endpoint),
            Transport::Listener(_) => None,
        }
    }

    pub fn document(&self) -> &Arc<dyn Document> {
        &self.document
    }

    /// Stop listening to the document and close every connection.
    /// Queued mutations are discarded. The controller cannot be
    /// restarted afterwards.
    pub async fn shutdown(&self) {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(subscription) = subscription else {
            return;
        };
        subscription.cancel();

        match &self.transport {
            Transport::Listener(listener) => {
                listener.stop().await;
            }
            Transport::Endpoint(endpoint) => endpoint.disconnect().await,
        }
        log::info!("{} controller shut down", self.role());
    }

    pub fn is_shut_down(&self) -> bool {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{NodePath, Tree};

    #[test]
    fn test_roles() {
        let tree: Arc<dyn Document> = Arc::new(Tree::new("root"));
        let server = SyncController::server(tree.clone(), ListenerConfig::default());
        assert_eq!(server.role(), SyncRole::Server);
        assert!(server.listener().is_some());
        assert!(server.endpoint().is_none());

        let client = SyncController::client(tree, EndpointConfig::default());
        assert_eq!(client.role(), SyncRole::Client);
        assert!(client.endpoint().is_some());
        assert!(client.listener().is_none());
    }

    #[tokio::test]
    async fn test_subscription_released_on_shutdown() {
        let tree = Arc::new(Tree::new("root"));
        let controller = SyncController::server(tree.clone(), ListenerConfig::default());
        assert_eq!(tree.listener_count(), 1);

        // No sessions yet; edits are simply not delivered anywhere.
        tree.set_property(&NodePath::root(), "title", "draft").unwrap();
        let stats = controller.listener().unwrap().stats();
        assert_eq!(stats.fan_out.mutations, 1);

        controller.shutdown().await;
        assert!(controller.is_shut_down());
        assert_eq!(tree.listener_count(), 0);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_client_start_failure_is_reported() {
        let controller = SyncController::client(
            Arc::new(Tree::new("root")),
            EndpointConfig::default(),
        );
        let err = controller.start("nowhere").await.unwrap_err();
        assert!(matches!(err, SyncError::Connect(_)));
    }
}
