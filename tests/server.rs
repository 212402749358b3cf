//! End-to-end tests over a real socket: authenticated clients joining a
//! room, submitting concurrent edits and converging on the same content.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

use coedit::config::Config;
use coedit::ot::Bundle;
use coedit::protocol::{ClientMessage, Envelope, ServerMessage};
use coedit::server::{build_auth, build_store, Server};
use coedit::types::factories::{document, participant, room};
use coedit::types::{ClientId, DocumentId, Role, RoomId};

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(address: &str) -> Self {
        let stream = TcpStream::connect(address).await.expect("connect");
        Self {
            framed: Framed::new(stream, LinesCodec::new()),
        }
    }

    async fn send(&mut self, message: ClientMessage) {
        let frame = serde_json::to_string(&Envelope::new(message)).unwrap();
        self.framed.send(frame).await.expect("send frame");
    }

    async fn recv(&mut self) -> ServerMessage {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("frame readable");
        serde_json::from_str::<Envelope<ServerMessage>>(&frame)
            .expect("server frame parses")
            .message
    }

    /// Skips membership/presence chatter until an operation arrives.
    async fn recv_operation(&mut self) -> (DocumentId, Bundle, u64) {
        loop {
            match self.recv().await {
                ServerMessage::OperationReceived {
                    doc_id,
                    op,
                    new_version,
                } => return (doc_id, op.bundle, new_version),
                ServerMessage::ParticipantJoined { .. }
                | ServerMessage::ParticipantLeft { .. }
                | ServerMessage::PresenceUpdated { .. } => {}
                other => panic!("expected operation-received, got {other:?}"),
            }
        }
    }

    async fn closed(mut self) -> bool {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match self.framed.next().await {
                    None => return true,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return true,
                }
            }
        })
        .await
        .unwrap_or(false)
    }
}

struct TestServer {
    address: String,
    server: Arc<Server>,
    doc_id: DocumentId,
}

async fn start_server() -> TestServer {
    let mut config = Config::default();
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.tokens = vec![
        ("tok-alice".into(), identity("alice")),
        ("tok-bob".into(), identity("bob")),
        ("tok-carol".into(), identity("carol")),
    ];

    let store = build_store(&config).expect("memory store");
    let auth = build_auth(&config);
    let server = Arc::new(Server::new(config, store, auth));

    server
        .store()
        .create_room(room("demo", "alice"))
        .await
        .unwrap();
    let doc = document("demo", "main.rs", "AB");
    server.store().create_document(doc.clone()).await.unwrap();
    // Carol may watch but not edit.
    server
        .store()
        .upsert_participant(participant("demo", "carol", Role::Viewer))
        .await
        .unwrap();

    let listener = server.bind().await.expect("bind");
    let address = listener.local_addr().unwrap().to_string();
    let accept = server.clone();
    tokio::spawn(async move { accept.listen(listener).await });

    TestServer {
        address,
        server,
        doc_id: doc.id,
    }
}

fn identity(user: &str) -> coedit::auth::Identity {
    coedit::auth::Identity {
        user_id: coedit::types::UserId::new(user),
        display_name: user.to_string(),
        avatar_url: None,
    }
}

async fn join(client: &mut Client, token: &str) {
    client
        .send(ClientMessage::Auth {
            token: token.to_string(),
        })
        .await;
    client
        .send(ClientMessage::JoinRoom {
            room_id: RoomId::new("demo"),
            resume_from_version: None,
        })
        .await;
    match client.recv().await {
        ServerMessage::RoomJoined { snapshot } => {
            assert_eq!(snapshot.room.id, RoomId::new("demo"));
        }
        other => panic!("expected room-joined, got {other:?}"),
    }
}

fn insert_at(position: usize, text: &str, base_len: usize) -> Bundle {
    let mut bundle = Bundle::default();
    bundle.retain(position);
    bundle.insert(text);
    bundle.retain(base_len - position);
    bundle
}

#[tokio::test]
async fn concurrent_edits_converge_across_clients() {
    let ts = start_server().await;

    let mut alice = Client::connect(&ts.address).await;
    join(&mut alice, "tok-alice").await;
    let mut bob = Client::connect(&ts.address).await;
    join(&mut bob, "tok-bob").await;

    // Both edit version 0 of "AB" concurrently.
    alice
        .send(ClientMessage::Operation {
            doc_id: ts.doc_id.clone(),
            ops: insert_at(1, "X", 2),
            base_version: 0,
            client_id: ClientId::new("alice-editor"),
            client_seq: 1,
        })
        .await;
    bob.send(ClientMessage::Operation {
        doc_id: ts.doc_id.clone(),
        ops: insert_at(1, "Y", 2),
        base_version: 0,
        client_id: ClientId::new("bob-editor"),
        client_seq: 1,
    })
    .await;

    // Every client replays the server's operation stream onto its copy of
    // the join snapshot; acks carry the server-transformed bundle.
    let mut alice_content = "AB".to_string();
    let mut bob_content = "AB".to_string();
    for expected_version in 1..=2 {
        let (_, bundle, version) = alice.recv_operation().await;
        assert_eq!(version, expected_version);
        alice_content = bundle.apply(&alice_content).unwrap();
    }
    for expected_version in 1..=2 {
        let (_, bundle, version) = bob.recv_operation().await;
        assert_eq!(version, expected_version);
        bob_content = bundle.apply(&bob_content).unwrap();
    }

    assert_eq!(alice_content, bob_content);
    let stored = ts.server.store().document(&ts.doc_id).await.unwrap();
    assert_eq!(stored.content, alice_content);
    assert_eq!(stored.version, 2);
}

#[tokio::test]
async fn viewers_are_rejected_over_the_wire() {
    let ts = start_server().await;

    let mut carol = Client::connect(&ts.address).await;
    join(&mut carol, "tok-carol").await;
    carol
        .send(ClientMessage::Operation {
            doc_id: ts.doc_id.clone(),
            ops: insert_at(0, "nope", 2),
            base_version: 0,
            client_id: ClientId::new("carol-editor"),
            client_seq: 1,
        })
        .await;

    match carol.recv().await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "READ_ONLY"),
        other => panic!("expected an error, got {other:?}"),
    }
    let stored = ts.server.store().document(&ts.doc_id).await.unwrap();
    assert_eq!(stored.version, 0);
}

#[tokio::test]
async fn resubmitting_after_a_lost_ack_is_idempotent() {
    let ts = start_server().await;

    let mut alice = Client::connect(&ts.address).await;
    join(&mut alice, "tok-alice").await;

    let operation = ClientMessage::Operation {
        doc_id: ts.doc_id.clone(),
        ops: insert_at(1, "X", 2),
        base_version: 0,
        client_id: ClientId::new("alice-editor"),
        client_seq: 7,
    };
    alice.send(operation.clone()).await;
    let (_, first_bundle, first_version) = alice.recv_operation().await;
    assert_eq!(first_version, 1);

    // Pretend the ack was lost and retry the identical submission.
    alice.send(operation).await;
    let (_, retry_bundle, retry_version) = alice.recv_operation().await;
    assert_eq!(retry_version, 1);
    assert_eq!(retry_bundle, first_bundle);

    let stored = ts.server.store().document(&ts.doc_id).await.unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.content, "AXB");
}

#[tokio::test]
async fn ping_pong_and_bad_token() {
    let ts = start_server().await;

    let mut alice = Client::connect(&ts.address).await;
    alice.send(ClientMessage::Ping).await;
    assert!(matches!(alice.recv().await, ServerMessage::Pong));

    let mut stranger = Client::connect(&ts.address).await;
    stranger
        .send(ClientMessage::Auth {
            token: "tok-wrong".to_string(),
        })
        .await;
    match stranger.recv().await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "INVALID_TOKEN"),
        other => panic!("expected an error, got {other:?}"),
    }
    assert!(stranger.closed().await);
}

#[tokio::test]
async fn malformed_frames_disconnect() {
    let ts = start_server().await;

    let mut client = Client::connect(&ts.address).await;
    client
        .framed
        .send(r#"{"type":"no-such-message","timestamp":0}"#.to_string())
        .await
        .unwrap();
    assert!(client.closed().await);
}

#[tokio::test]
async fn joining_before_authenticating_is_refused() {
    let ts = start_server().await;

    let mut client = Client::connect(&ts.address).await;
    client
        .send(ClientMessage::JoinRoom {
            room_id: RoomId::new("demo"),
            resume_from_version: None,
        })
        .await;
    match client.recv().await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "AUTH_REQUIRED"),
        other => panic!("expected an error, got {other:?}"),
    }
}
