//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full pipeline from frame to page and back.

use std::sync::Arc;

use logos_pages::operation::Placement;
use logos_pages::{
    fields, BlockType, ClientMessage, ConnectionState, DocumentStore, Identity,
    MemoryDocumentStore, OperationKind, OperationRequest, PageId, PageInfo, PagesClient,
    PagesConfig, PagesServer, PresenceChange, ProtocolError, RejectReason, ServerConfig,
    ServerMessage, StaticIdentityService, UpdateMode,
};
use tokio::net::TcpListener;
use tokio::time::Duration;
use uuid::Uuid;

struct TestServer {
    server: Arc<PagesServer>,
    url: String,
    page_id: PageId,
}

/// Start a server on a free port with one page and two tokens.
async fn start_test_server() -> TestServer {
    let documents = Arc::new(MemoryDocumentStore::new());
    let page = PageInfo::new(Uuid::new_v4(), Uuid::new_v4(), "Shared notes");
    let page_id = page.id;
    documents.create_page(page).await.unwrap();

    let identity = StaticIdentityService::new()
        .with_grant(
            "alice-token",
            Identity {
                user_id: Uuid::new_v4(),
                display_name: "Alice".into(),
            },
        )
        .with_grant(
            "bob-token",
            Identity {
                user_id: Uuid::new_v4(),
                display_name: "Bob".into(),
            },
        );
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        pages: PagesConfig::for_testing(),
        ..ServerConfig::default()
    };
    let server = Arc::new(PagesServer::new(config, documents, Arc::new(identity)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    TestServer {
        server,
        url,
        page_id,
    }
}

async fn connect(url: &str, token: &str) -> PagesClient {
    let mut client = PagesClient::connect(url)
        .await
        .unwrap()
        .with_timeout(Duration::from_secs(2));
    client.authenticate(token).await.unwrap();
    client
}

fn insert(page_id: PageId, block_id: Uuid, text: &str, observed: u64) -> OperationRequest {
    OperationRequest {
        page_id,
        block_id,
        kind: OperationKind::Insert {
            parent_id: None,
            placement: Placement::End,
            block_type: BlockType::Paragraph,
            content: fields([("text", text)]),
        },
        base_version: 0,
        observed_sequence: observed,
    }
}

fn is_ack(client_ref: u64) -> impl Fn(&ServerMessage) -> bool {
    move |m| matches!(m, ServerMessage::OperationAck { client_ref: r, .. } if *r == client_ref)
}

fn is_applied(m: &ServerMessage) -> bool {
    matches!(m, ServerMessage::OperationApplied { .. })
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let t = start_test_server().await;
    let client = PagesClient::connect(&t.url).await.unwrap();
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_bad_token_is_refused() {
    let t = start_test_server().await;
    let mut client = PagesClient::connect(&t.url)
        .await
        .unwrap()
        .with_timeout(Duration::from_secs(2));
    let err = client.authenticate("guess").await.unwrap_err();
    assert!(matches!(err, ProtocolError::UnexpectedFrame(_)));
    assert!(matches!(
        client.recv().await,
        Err(ProtocolError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_edits_fan_out_and_replicas_converge() {
    let t = start_test_server().await;
    let mut alice = connect(&t.url, "alice-token").await;
    let mut bob = connect(&t.url, "bob-token").await;
    let mut alice_page = alice.subscribe(t.page_id, None).await.unwrap();
    let mut bob_page = bob.subscribe(t.page_id, None).await.unwrap();

    let block_id = Uuid::new_v4();
    let r = alice
        .submit(insert(t.page_id, block_id, "hello", 0))
        .await
        .unwrap();
    let ack = alice.recv_until(is_ack(r)).await.unwrap();
    alice_page.observe(&ack).unwrap();

    let applied = bob.recv_until(is_applied).await.unwrap();
    bob_page.observe(&applied).unwrap();
    assert_eq!(bob_page.sequence(), 1);

    let r = bob
        .submit(OperationRequest {
            page_id: t.page_id,
            block_id,
            kind: OperationKind::Update {
                block_type: Some(BlockType::Todo),
                fields: fields([("checked", true)]),
                mode: UpdateMode::Fields,
            },
            base_version: 1,
            observed_sequence: 1,
        })
        .await
        .unwrap();
    let ack = bob.recv_until(is_ack(r)).await.unwrap();
    bob_page.observe(&ack).unwrap();
    let applied = alice.recv_until(is_applied).await.unwrap();
    alice_page.observe(&applied).unwrap();

    let server = t.server.manager().get_snapshot(t.page_id).await.unwrap();
    assert_eq!(alice_page.snapshot(), server);
    assert_eq!(bob_page.snapshot(), server);
    let block = server.find(block_id).unwrap();
    assert_eq!(block.block_type, BlockType::Todo);
    assert_eq!(block.text("text"), Some("hello"));
}

#[tokio::test]
async fn test_rejection_goes_to_sender_only() {
    let t = start_test_server().await;
    let mut alice = connect(&t.url, "alice-token").await;
    alice.subscribe(t.page_id, None).await.unwrap();

    let missing = Uuid::new_v4();
    let r = alice
        .submit(OperationRequest {
            page_id: t.page_id,
            block_id: missing,
            kind: OperationKind::Delete,
            base_version: 1,
            observed_sequence: 0,
        })
        .await
        .unwrap();
    let rejected = alice
        .recv_until(|m| matches!(m, ServerMessage::OperationRejected { .. }))
        .await
        .unwrap();
    assert_eq!(
        rejected,
        ServerMessage::OperationRejected {
            client_ref: r,
            page_id: t.page_id,
            reason: RejectReason::NotFound { block_id: missing },
        }
    );
}

#[tokio::test]
async fn test_presence_join_and_leave() {
    let t = start_test_server().await;
    let mut alice = connect(&t.url, "alice-token").await;
    alice.subscribe(t.page_id, None).await.unwrap();

    let mut bob = connect(&t.url, "bob-token").await;
    bob.subscribe(t.page_id, None).await.unwrap();

    let joined = alice
        .recv_until(|m| {
            matches!(m, ServerMessage::PresenceChanged { change: PresenceChange::Joined(_), .. })
        })
        .await
        .unwrap();
    match joined {
        ServerMessage::PresenceChanged {
            change: PresenceChange::Joined(entry),
            ..
        } => assert_eq!(entry.display_name, "Bob"),
        other => panic!("unexpected {other:?}"),
    }

    bob.close().await.unwrap();
    alice
        .recv_until(|m| {
            matches!(m, ServerMessage::PresenceChanged { change: PresenceChange::Left { .. }, .. })
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_reconnect_with_since_replays() {
    let t = start_test_server().await;
    let mut bob = connect(&t.url, "bob-token").await;
    bob.subscribe(t.page_id, None).await.unwrap();

    let mut alice = connect(&t.url, "alice-token").await;
    let mut page = alice.subscribe(t.page_id, None).await.unwrap();
    let r = alice
        .submit(insert(t.page_id, Uuid::new_v4(), "first", 0))
        .await
        .unwrap();
    let ack = alice.recv_until(is_ack(r)).await.unwrap();
    page.observe(&ack).unwrap();
    alice.close().await.unwrap();
    drop(alice);

    // Bob keeps the page open and edits while Alice is away.
    for (i, text) in ["second", "third"].into_iter().enumerate() {
        let r = bob
            .submit(insert(t.page_id, Uuid::new_v4(), text, i as u64 + 1))
            .await
            .unwrap();
        bob.recv_until(is_ack(r)).await.unwrap();
    }

    let mut alice = connect(&t.url, "alice-token").await;
    alice
        .send(ClientMessage::Subscribe {
            page_id: t.page_id,
            since: Some(page.sequence()),
        })
        .await
        .unwrap();
    let replay = alice
        .recv_until(|m| matches!(m, ServerMessage::Replay { .. } | ServerMessage::Snapshot { .. }))
        .await
        .unwrap();
    match &replay {
        ServerMessage::Replay { operations, .. } => {
            let seqs: Vec<u64> = operations.iter().map(|op| op.sequence).collect();
            assert_eq!(seqs, vec![2, 3]);
        }
        other => panic!("expected replay, got {other:?}"),
    }
    page.observe(&replay).unwrap();
    let server = t.server.manager().get_snapshot(t.page_id).await.unwrap();
    assert_eq!(page.snapshot(), server);
}

#[tokio::test]
async fn test_heartbeat_ack_and_stats() {
    let t = start_test_server().await;
    let mut alice = connect(&t.url, "alice-token").await;
    alice.heartbeat().await.unwrap();
    alice
        .recv_until(|m| matches!(m, ServerMessage::HeartbeatAck))
        .await
        .unwrap();

    let stats = t.server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert!(stats.total_messages >= 2);
}
