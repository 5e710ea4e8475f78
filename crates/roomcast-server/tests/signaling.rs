//! Integration tests for the signaling server.
//!
//! Tests the following over a real bound listener:
//! - the two-participant join/present/chat/disconnect session flow
//! - directed WebRTC envelope routing with forced sender ids
//! - presenter-stopped observed exactly once by other participants

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use roomcast_common::{ClientEvent, ConnectionStatus, ServerEvent};
use roomcast_server::{router, AppState};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server() -> SocketAddr {
    let state = AppState::new(500);
    let app = router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server crashed");
    });
    addr
}

struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    id: String,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("websocket connect failed");
        let mut client = Self {
            ws,
            id: String::new(),
        };
        match client.recv().await {
            ServerEvent::SessionBound { connection_id } => client.id = connection_id,
            other => panic!("expected session-bound first, got {other:?}"),
        }
        client
    }

    async fn send(&mut self, event: &ClientEvent) {
        let text = serde_json::to_string(event).expect("serialize event");
        self.ws
            .send(Message::Text(text))
            .await
            .expect("websocket send failed");
    }

    async fn recv(&mut self) -> ServerEvent {
        tokio::time::timeout(RECV_TIMEOUT, async {
            loop {
                let msg = self
                    .ws
                    .next()
                    .await
                    .expect("connection closed")
                    .expect("websocket error");
                if let Message::Text(text) = msg {
                    return serde_json::from_str(&text).expect("invalid server event");
                }
            }
        })
        .await
        .expect("timed out waiting for server event")
    }

    /// Receive until a roster update arrives, returning it.
    async fn recv_roster(&mut self) -> Vec<roomcast_common::Participant> {
        loop {
            if let ServerEvent::ParticipantsUpdated(roster) = self.recv().await {
                return roster;
            }
        }
    }
}

fn join(room: &str, name: &str) -> ClientEvent {
    ClientEvent::JoinRoom {
        room_id: room.to_string(),
        user_name: name.to_string(),
    }
}

#[tokio::test]
async fn two_participant_session_flow() {
    let addr = start_server().await;

    let mut alice = TestClient::connect(addr).await;
    alice.send(&join("R1", "Alice")).await;
    let roster = alice.recv_roster().await;
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].id, alice.id);

    // Alice's own join message.
    match alice.recv().await {
        ServerEvent::NewMessage(msg) => assert!(msg.text.contains("Alice joined")),
        other => panic!("expected join message, got {other:?}"),
    }

    let mut bob = TestClient::connect(addr).await;
    bob.send(&join("R1", "Bob")).await;

    // Both sides see the two-member roster and the system message.
    let roster = alice.recv_roster().await;
    assert_eq!(roster.len(), 2);
    match alice.recv().await {
        ServerEvent::NewMessage(msg) => {
            assert_eq!(msg.user_id, "system");
            assert!(msg.text.contains("Bob joined the room"));
        }
        other => panic!("expected system message, got {other:?}"),
    }
    let roster = bob.recv_roster().await;
    assert_eq!(roster.len(), 2);
    let _bob_join_msg = bob.recv().await;

    // Alice starts presenting; Bob is told, Alice is not.
    alice
        .send(&ClientEvent::StartPresenting {
            room_id: "R1".into(),
            user_name: "Alice".into(),
        })
        .await;

    let roster = bob.recv_roster().await;
    assert!(roster.iter().any(|p| p.id == alice.id && p.is_presenting));
    let _sharing_msg = bob.recv().await;
    match bob.recv().await {
        ServerEvent::PresenterStarted {
            presenter_id,
            presenter_name,
        } => {
            assert_eq!(presenter_id, alice.id);
            assert_eq!(presenter_name, "Alice");
        }
        other => panic!("expected presenter-started, got {other:?}"),
    }

    let _alice_roster = alice.recv_roster().await;
    let _alice_sharing_msg = alice.recv().await;

    // Offer/answer exchange through the relay.
    alice
        .send(&ClientEvent::WebrtcOffer {
            room_id: "R1".into(),
            offer: json!({"type": "offer", "sdp": "v=0 fake-offer"}),
            target_id: bob.id.clone(),
        })
        .await;
    match bob.recv().await {
        ServerEvent::WebrtcOffer { offer, sender_id } => {
            assert_eq!(sender_id, alice.id);
            assert_eq!(offer["sdp"], "v=0 fake-offer");
        }
        other => panic!("expected offer, got {other:?}"),
    }

    bob.send(&ClientEvent::WebrtcAnswer {
        room_id: "R1".into(),
        answer: json!({"type": "answer", "sdp": "v=0 fake-answer"}),
        target_id: alice.id.clone(),
    })
    .await;
    match alice.recv().await {
        ServerEvent::WebrtcAnswer { answer, sender_id } => {
            assert_eq!(sender_id, bob.id);
            assert_eq!(answer["type"], "answer");
        }
        other => panic!("expected answer, got {other:?}"),
    }

    // Chat: both receive the same server-assigned message id, and the
    // claimed userId is ignored in favour of the real connection id.
    alice
        .send(&ClientEvent::SendMessage {
            room_id: "R1".into(),
            message: "hi".into(),
            user_name: "Alice".into(),
            user_id: Some("spoofed-id".into()),
        })
        .await;
    let alice_copy = match alice.recv().await {
        ServerEvent::NewMessage(msg) => msg,
        other => panic!("expected chat message, got {other:?}"),
    };
    let bob_copy = match bob.recv().await {
        ServerEvent::NewMessage(msg) => msg,
        other => panic!("expected chat message, got {other:?}"),
    };
    assert_eq!(alice_copy.id, bob_copy.id);
    assert_eq!(alice_copy.user_id, alice.id);
    assert_eq!(alice_copy.text, "hi");

    // Bob drops abruptly: Alice sees roster [Alice] and a disconnect notice.
    drop(bob);
    let roster = alice.recv_roster().await;
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].id, alice.id);
    match alice.recv().await {
        ServerEvent::NewMessage(msg) => assert!(msg.text.contains("Bob disconnected")),
        other => panic!("expected disconnect message, got {other:?}"),
    }
}

#[tokio::test]
async fn directed_envelopes_only_reach_target() {
    let addr = start_server().await;

    let mut alice = TestClient::connect(addr).await;
    let mut bob = TestClient::connect(addr).await;
    let mut cara = TestClient::connect(addr).await;
    alice.send(&join("R2", "Alice")).await;
    bob.send(&join("R2", "Bob")).await;
    cara.send(&join("R2", "Cara")).await;

    // Drain join traffic: each member ends up seeing the 3-member roster.
    while alice.recv_roster().await.len() < 3 {}
    while bob.recv_roster().await.len() < 3 {}
    while cara.recv_roster().await.len() < 3 {}
    let _ = bob.recv().await; // Cara's join message
    let _ = cara.recv().await; // Cara's own join message

    alice
        .send(&ClientEvent::WebrtcIceCandidate {
            room_id: "R2".into(),
            candidate: json!({"candidate": "candidate:0 1 UDP 1 10.0.0.1 5000 typ host"}),
            target_id: bob.id.clone(),
        })
        .await;
    // A room-wide chat follows; Cara must see the chat *first* since the
    // candidate was never addressed to her.
    alice
        .send(&ClientEvent::SendMessage {
            room_id: "R2".into(),
            message: "after-candidate".into(),
            user_name: "Alice".into(),
            user_id: None,
        })
        .await;

    match bob.recv().await {
        ServerEvent::WebrtcIceCandidate { sender_id, .. } => assert_eq!(sender_id, alice.id),
        other => panic!("expected candidate, got {other:?}"),
    }
    match cara.recv().await {
        ServerEvent::NewMessage(msg) => assert_eq!(msg.text, "after-candidate"),
        other => panic!("candidate leaked to non-target: {other:?}"),
    }
}

#[tokio::test]
async fn presenter_stop_is_observed_exactly_once() {
    let addr = start_server().await;

    let mut alice = TestClient::connect(addr).await;
    let mut bob = TestClient::connect(addr).await;
    alice.send(&join("R3", "Alice")).await;
    bob.send(&join("R3", "Bob")).await;
    while alice.recv_roster().await.len() < 2 {}
    let _ = alice.recv().await;
    while bob.recv_roster().await.len() < 2 {}
    let _ = bob.recv().await;

    alice
        .send(&ClientEvent::StartPresenting {
            room_id: "R3".into(),
            user_name: "Alice".into(),
        })
        .await;
    let _ = bob.recv_roster().await;
    let _ = bob.recv().await; // sharing system message
    match bob.recv().await {
        ServerEvent::PresenterStarted { .. } => {}
        other => panic!("expected presenter-started, got {other:?}"),
    }

    alice
        .send(&ClientEvent::StopPresenting {
            room_id: "R3".into(),
            user_name: "Alice".into(),
        })
        .await;
    let _ = bob.recv_roster().await;
    let _ = bob.recv().await; // stopped-sharing system message
    match bob.recv().await {
        ServerEvent::PresenterStopped { presenter_id } => assert_eq!(presenter_id, alice.id),
        other => panic!("expected presenter-stopped, got {other:?}"),
    }

    // Nothing further queued: the next event Bob sees is ordinary chat.
    alice
        .send(&ClientEvent::SendMessage {
            room_id: "R3".into(),
            message: "done".into(),
            user_name: "Alice".into(),
            user_id: None,
        })
        .await;
    match bob.recv().await {
        ServerEvent::NewMessage(msg) => assert_eq!(msg.text, "done"),
        other => panic!("saw duplicate presenter event: {other:?}"),
    }
}

#[tokio::test]
async fn status_updates_rebroadcast_roster() {
    let addr = start_server().await;

    let mut alice = TestClient::connect(addr).await;
    let mut bob = TestClient::connect(addr).await;
    alice.send(&join("R4", "Alice")).await;
    bob.send(&join("R4", "Bob")).await;
    while alice.recv_roster().await.len() < 2 {}
    let _ = alice.recv().await;

    bob.send(&ClientEvent::ConnectionStatusUpdate {
        room_id: "R4".into(),
        status: ConnectionStatus::Failed,
    })
    .await;

    let roster = alice.recv_roster().await;
    let bob_entry = roster
        .iter()
        .find(|p| p.id == bob.id)
        .expect("bob in roster");
    assert_eq!(bob_entry.connection_status, ConnectionStatus::Failed);
}
