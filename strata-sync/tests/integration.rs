//! End-to-end replication over real WebSocket connections.
//!
//! Every test starts a listener on an ephemeral localhost port and
//! connects real endpoints to it.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use strata_core::{Node, NodePath, SessionId, StatusCode, Tree, Value};
use strata_sync::{
    ConnectError, ConnectionState, EndpointConfig, Frame, FrameKind, Handshake, ListenerConfig,
    ReconnectPolicy, SyncController, SyncMode, SyncSession,
};
use tokio::time::{sleep, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Poll `cond` until it holds, panicking after a few seconds.
async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

fn seeded_tree() -> Arc<Tree> {
    let tree = Tree::new("document");
    tree.set_property(&NodePath::root(), "title", "Quarterly plan").unwrap();
    tree.append_child(&NodePath::root(), Node::new("section").with_property("heading", "Goals"))
        .unwrap();
    tree.append_child(&NodePath::root(), Node::new("section").with_property("heading", "Risks"))
        .unwrap();
    Arc::new(tree)
}

async fn start_server(tree: &Arc<Tree>, config: ListenerConfig) -> (SyncController, String) {
    let server = SyncController::server(tree.clone(), config);
    server.start("127.0.0.1:0").await.unwrap();
    let addr = server.listener().unwrap().local_addr().unwrap();
    (server, addr.to_string())
}

fn fast_reconnect(max_attempts: Option<u32>) -> EndpointConfig {
    EndpointConfig {
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_attempts,
            ..ReconnectPolicy::default()
        },
        ..EndpointConfig::default()
    }
}

async fn join(addr: &str, config: EndpointConfig) -> (SyncController, Arc<Tree>) {
    let replica = Arc::new(Tree::new("replica"));
    let client = SyncController::client(replica.clone(), config);
    client.start(addr).await.unwrap();
    (client, replica)
}

fn client_session(client: &SyncController) -> Option<Arc<SyncSession>> {
    client.endpoint().unwrap().session()
}

async fn wait_active(client: &SyncController) {
    eventually("client session active", || {
        client_session(client).is_some_and(|s| s.is_active())
    })
    .await;
}

#[tokio::test]
async fn test_clients_converge_on_server_edits() {
    let tree = seeded_tree();
    let (server, addr) = start_server(&tree, ListenerConfig::default()).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(join(&addr, EndpointConfig::default()).await);
    }
    for (client, replica) in &clients {
        wait_active(client).await;
        assert_eq!(replica.root(), tree.root());
    }
    let listener = server.listener().unwrap();
    eventually("server sessions active", || listener.active_session_count() == 3).await;
    assert_eq!(listener.status().get().connected_sessions, 3);

    let root = NodePath::root();
    tree.set_property(&root, "title", "Quarterly plan v2").unwrap();
    tree.append_child(&root, Node::new("section").with_property("heading", "Budget"))
        .unwrap();
    tree.move_child(&root, 2, 0).unwrap();
    tree.set_property(&root.child(0), "collapsed", true).unwrap();
    tree.remove_child(&root, 2).unwrap();

    for (_, replica) in &clients {
        eventually("replica converges", || replica.root() == tree.root()).await;
    }
    assert_eq!(
        clients[0].1.property(&root.child(0), "heading"),
        Some(Value::from("Budget"))
    );

    // Nothing the clients applied was sent back up.
    for (client, _) in &clients {
        let stats = client_session(client).unwrap().stats();
        assert_eq!(stats.diffs_sent, 0);
        assert_eq!(stats.resyncs, 0);
    }

    for (client, _) in &clients {
        client.shutdown().await;
    }
    server.shutdown().await;
}

#[tokio::test]
async fn test_client_edit_reaches_everyone_but_its_author() {
    let tree = seeded_tree();
    let (server, addr) = start_server(&tree, ListenerConfig::default()).await;
    let (alice, alice_tree) = join(&addr, EndpointConfig::default()).await;
    let (bob, bob_tree) = join(&addr, EndpointConfig::default()).await;
    wait_active(&alice).await;
    wait_active(&bob).await;
    let listener = server.listener().unwrap();
    eventually("server sessions active", || listener.active_session_count() == 2).await;

    alice_tree
        .set_property(&NodePath::root().child(1), "owner", "alice")
        .unwrap();

    eventually("server applies alice's edit", || {
        tree.property(&NodePath::root().child(1), "owner") == Some(Value::from("alice"))
    })
    .await;
    eventually("bob sees alice's edit", || bob_tree.root() == tree.root()).await;

    // Give a stray echo time to show up before checking for it.
    sleep(Duration::from_millis(100)).await;
    let alice_stats = client_session(&alice).unwrap().stats();
    assert_eq!(alice_stats.diffs_sent, 1);
    assert_eq!(alice_stats.diffs_applied, 0);
    assert_eq!(client_session(&bob).unwrap().stats().diffs_applied, 1);
    assert!(listener.stats().fan_out.suppressed >= 1);

    alice.shutdown().await;
    bob.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_receive_only_client_keeps_local_edits_local() {
    let tree = seeded_tree();
    let (server, addr) = start_server(&tree, ListenerConfig::default()).await;
    let config = EndpointConfig {
        mode: SyncMode::ReceiveOnly,
        ..EndpointConfig::default()
    };
    let (viewer, viewer_tree) = join(&addr, config).await;
    wait_active(&viewer).await;

    viewer_tree.set_property(&NodePath::root(), "scribble", 1).unwrap();
    tree.set_property(&NodePath::root(), "status", "review").unwrap();

    eventually("viewer sees server edit", || {
        viewer_tree.property(&NodePath::root(), "status") == Some(Value::from("review"))
    })
    .await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(tree.property(&NodePath::root(), "scribble"), None);
    assert_eq!(client_session(&viewer).unwrap().stats().diffs_sent, 0);

    viewer.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_dropped_session_reconnects_and_resyncs() {
    let tree = seeded_tree();
    let (server, addr) = start_server(&tree, ListenerConfig::default()).await;
    let (client, replica) = join(&addr, fast_reconnect(Some(5))).await;
    wait_active(&client).await;

    let endpoint = client.endpoint().unwrap();
    let first: SessionId = endpoint.status().get().session.unwrap();
    let listener = server.listener().unwrap();
    eventually("server knows the session", || listener.session(first).is_some()).await;

    assert!(listener.drop_session(first));
    // Edits made while the client is away arrive in the new snapshot.
    tree.set_property(&NodePath::root(), "title", "edited while away").unwrap();

    let mut status = endpoint.status();
    let reconnected = tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.state.is_connected() && s.session.is_some_and(|id| id != first)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reconnected.reconnect_attempt, 0);

    eventually("replica resynced", || replica.root() == tree.root()).await;
    assert_eq!(endpoint.stats().reconnects, 1);
    assert!(listener.session(first).is_none());

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_manual_disconnect_does_not_reconnect() {
    let tree = seeded_tree();
    let (server, addr) = start_server(&tree, ListenerConfig::default()).await;
    let (client, _) = join(&addr, fast_reconnect(None)).await;
    wait_active(&client).await;
    let listener = server.listener().unwrap();
    eventually("server session registered", || listener.session_count() == 1).await;

    let endpoint = client.endpoint().unwrap();
    endpoint.disconnect().await;
    assert_eq!(endpoint.state(), ConnectionState::Disconnected);
    eventually("server drops the session", || listener.session_count() == 0).await;

    sleep(Duration::from_millis(200)).await;
    assert_eq!(endpoint.state(), ConnectionState::Disconnected);
    assert_eq!(endpoint.stats().reconnects, 0);
    assert_eq!(listener.session_count(), 0);

    // An explicit connect is allowed again afterwards.
    endpoint.connect(&addr).await.unwrap();
    wait_active(&client).await;

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_gives_up_after_retry_budget() {
    let tree = seeded_tree();
    let (server, addr) = start_server(&tree, ListenerConfig::default()).await;
    let (client, _) = join(&addr, fast_reconnect(Some(2))).await;
    wait_active(&client).await;

    assert_eq!(server.listener().unwrap().stop().await, StatusCode::StoppedOkay);

    let mut status = client.endpoint().unwrap().status();
    let failed = tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.state.is_failed()))
        .await
        .unwrap()
        .unwrap();
    match failed.state {
        ConnectionState::Failed(reason) => assert!(reason.contains("2 reconnect attempts"), "{reason}"),
        other => panic!("unexpected state {other}"),
    }
    assert!(client_session(&client).is_none());

    client.shutdown().await;
}

#[tokio::test]
async fn test_refused_connect_surfaces_failed() {
    let port = {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };
    let client = SyncController::client(Arc::new(Tree::new("replica")), EndpointConfig::default());
    let err = client.start(&format!("127.0.0.1:{port}")).await.unwrap_err();
    assert!(err.to_string().contains("transport error"), "{err}");
    assert!(client.endpoint().unwrap().state().is_failed());
}

#[tokio::test]
async fn test_listener_rejects_when_full() {
    let tree = seeded_tree();
    let config = ListenerConfig {
        max_sessions: 1,
        ..ListenerConfig::default()
    };
    let (server, addr) = start_server(&tree, config).await;
    let (first, _) = join(&addr, EndpointConfig::default()).await;
    wait_active(&first).await;

    let second = SyncController::client(Arc::new(Tree::new("replica")), EndpointConfig::default());
    let endpoint = second.endpoint().unwrap();
    let err = endpoint.connect(&addr).await.unwrap_err();
    assert!(matches!(err, ConnectError::Handshake(ref r) if r.contains("server full")), "{err}");
    assert!(endpoint.state().is_failed());
    assert_eq!(server.listener().unwrap().stats().rejected_connections, 1);

    first.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_listener_rejects_bad_magic() {
    let tree = seeded_tree();
    let (server, addr) = start_server(&tree, ListenerConfig::default()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    let mut hello = Handshake::new(Uuid::new_v4(), SyncMode::Bidirectional);
    hello.magic = 0xDEAD_BEEF;
    let bytes = Frame::hello(&hello).unwrap().encode().unwrap();
    ws.send(Message::Binary(bytes.into())).await.unwrap();

    let reply = loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => break Frame::decode(&data).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("expected a Reject frame, got {other:?}"),
        }
    };
    assert_eq!(reply.kind, FrameKind::Reject);
    assert!(reply.reason().unwrap().contains("bad magic"));
    assert_eq!(server.listener().unwrap().session_count(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_listener_status_lifecycle() {
    let tree = seeded_tree();
    let server = SyncController::server(tree, ListenerConfig::default());
    let listener = server.listener().unwrap().clone();
    let mut status = listener.status();
    assert_eq!(status.get().status, StatusCode::Initialized);

    server.start("127.0.0.1:0").await.unwrap();
    let started = status.wait_for(|s| s.running).await.unwrap();
    assert_eq!(started.status, StatusCode::StartedOkay);
    let addr = started.local_addr.unwrap().to_string();

    let (client, _) = join(&addr, EndpointConfig::default()).await;
    let counted = tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.connected_sessions == 1),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(counted.running);

    client.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.connected_sessions == 0))
        .await
        .unwrap()
        .unwrap();

    server.shutdown().await;
    let stopped = listener.status().get();
    assert!(!stopped.running);
    assert_eq!(stopped.status, StatusCode::StoppedOkay);
    assert_eq!(listener.stop().await, StatusCode::AlreadyStopped);
}
