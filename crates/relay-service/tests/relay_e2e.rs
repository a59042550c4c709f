//! End-to-end relay tests over real WebSockets.
//!
//! Each test spawns a relay on a random port with in-memory backends and
//! drives it with `TestClient`s.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use common::types::{RoomSlug, UserId};
use relay_service::registry::SessionRegistry;
use relay_test_utils::{Closed, TestClient, TestRelayOptions, TestRelayServer, TestTokenBuilder};
use signaling_protocol::{error_codes, ClientMessage, ServerEvent, SignalKind};

const ROOM: &str = "standup";

async fn authed(server: &TestRelayServer, user: &str, name: &str) -> TestClient {
    let token = server.register_user(user, name);
    let mut client = TestClient::connect(&server.ws_url()).await.unwrap();
    client.authenticate(&token).await.unwrap();
    client
}

async fn room_members(server: &TestRelayServer, room: &str) -> Vec<UserId> {
    let mut members: Vec<UserId> = server
        .registry()
        .list_participants(&RoomSlug::from(room))
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.snapshot.user_id)
        .collect();
    members.sort();
    members
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_invalid_token_gets_error_then_close() {
    let server = TestRelayServer::spawn().await.unwrap();
    let mut client = TestClient::connect(&server.ws_url()).await.unwrap();

    let forged = TestTokenBuilder::new()
        .for_user("mallory")
        .signed_with("not-the-relay-secret")
        .build();
    client
        .send(&ClientMessage::Authenticate { token: forged })
        .await
        .unwrap();

    let ServerEvent::Error { code, message, .. } = client.recv().await.unwrap() else {
        panic!("expected error");
    };
    assert_eq!(code, error_codes::UNAUTHORIZED);
    assert_eq!(message, "Authentication failed");
    assert_eq!(client.expect_closed().await.unwrap(), Closed::Frame(1000));
}

#[tokio::test]
async fn test_unauthenticated_socket_is_closed_after_deadline() {
    let server = TestRelayServer::spawn_with(TestRelayOptions {
        auth_timeout: Duration::from_millis(200),
        ..TestRelayOptions::default()
    })
    .await
    .unwrap();
    let mut client = TestClient::connect(&server.ws_url()).await.unwrap();

    let ServerEvent::Error { code, .. } = client.recv().await.unwrap() else {
        panic!("expected error");
    };
    assert_eq!(code, error_codes::UNAUTHORIZED);
    assert!(matches!(
        client.expect_closed().await.unwrap(),
        Closed::Frame(_) | Closed::Eof
    ));
}

#[tokio::test]
async fn test_room_messages_require_authentication() {
    let server = TestRelayServer::spawn().await.unwrap();
    server.directory().with_room(ROOM, "alice", None, 10);
    let mut client = TestClient::connect(&server.ws_url()).await.unwrap();

    client
        .send_raw(r#"{"type":"join","room":"standup"}"#)
        .await
        .unwrap();
    let ServerEvent::Error { code, .. } = client.recv().await.unwrap() else {
        panic!("expected error");
    };
    assert_eq!(code, error_codes::UNAUTHORIZED);

    // Still open
    client.send(&ClientMessage::Ping).await.unwrap();
    assert_eq!(client.recv().await.unwrap(), ServerEvent::Pong);
    assert!(room_members(&server, ROOM).await.is_empty());
}

// ============================================================================
// Join and negotiation relay
// ============================================================================

#[tokio::test]
async fn test_second_joiner_sees_first_and_gets_offer_hint() {
    let server = TestRelayServer::spawn().await.unwrap();
    server.directory().with_room(ROOM, "alice", None, 10);

    let mut alice = authed(&server, "alice", "Alice").await;
    let mut bob = authed(&server, "bob", "Bob").await;

    let others = alice.join(ROOM, None).await.unwrap();
    assert!(others.is_empty());

    let others = bob.join(ROOM, None).await.unwrap();
    assert_eq!(others.len(), 1);
    let first = others.first().unwrap();
    assert_eq!(first.user_id, UserId::from("alice"));
    assert!(first.is_host);

    let ServerEvent::RequestOffers { participants, .. } = bob.recv().await.unwrap() else {
        panic!("expected request-offers");
    };
    assert_eq!(participants.len(), 1);

    let ServerEvent::UserJoined { participant, .. } = alice.recv().await.unwrap() else {
        panic!("expected user-joined");
    };
    assert_eq!(participant.user_id, UserId::from("bob"));
    assert_eq!(participant.display_name, "Bob");
    assert!(!participant.is_host);

    assert_eq!(
        room_members(&server, ROOM).await,
        vec![UserId::from("alice"), UserId::from("bob")]
    );
}

#[tokio::test]
async fn test_signal_is_relayed_with_sender_attached() {
    let server = TestRelayServer::spawn().await.unwrap();
    server.directory().with_room(ROOM, "alice", None, 10);

    let mut alice = authed(&server, "alice", "Alice").await;
    let mut bob = authed(&server, "bob", "Bob").await;
    alice.join(ROOM, None).await.unwrap();
    bob.join(ROOM, None).await.unwrap();
    alice
        .recv_until(|e| matches!(e, ServerEvent::UserJoined { .. }))
        .await
        .unwrap();

    bob.send(&ClientMessage::Signal {
        room: RoomSlug::from(ROOM),
        to: UserId::from("alice"),
        kind: SignalKind::Offer,
        payload: serde_json::json!({"type": "offer", "sdp": "v=0"}),
    })
    .await
    .unwrap();

    let ServerEvent::Signal(envelope) = alice.recv().await.unwrap() else {
        panic!("expected signal");
    };
    assert_eq!(envelope.from, UserId::from("bob"));
    assert_eq!(envelope.kind, SignalKind::Offer);
    assert_eq!(envelope.payload["sdp"], "v=0");

    // Signals to absent peers are dropped without an error
    bob.send(&ClientMessage::Signal {
        room: RoomSlug::from(ROOM),
        to: UserId::from("nobody"),
        kind: SignalKind::IceCandidate,
        payload: serde_json::json!({"candidate": ""}),
    })
    .await
    .unwrap();
    bob.expect_silence(Duration::from_millis(200)).await.unwrap();
}

#[tokio::test]
async fn test_full_room_rejects_join() {
    let server = TestRelayServer::spawn().await.unwrap();
    server.directory().with_room(ROOM, "alice", None, 1);

    let mut alice = authed(&server, "alice", "Alice").await;
    let mut bob = authed(&server, "bob", "Bob").await;
    alice.join(ROOM, None).await.unwrap();

    bob.send(&ClientMessage::Join {
        room: RoomSlug::from(ROOM),
        password: None,
        muted: false,
        camera_off: false,
    })
    .await
    .unwrap();
    assert_eq!(
        bob.recv().await.unwrap(),
        ServerEvent::JoinResponse {
            room: RoomSlug::from(ROOM),
            success: false,
            error: Some("Room is full".to_string()),
        }
    );
    assert_eq!(room_members(&server, ROOM).await, vec![UserId::from("alice")]);
}

#[tokio::test]
async fn test_password_protected_room() {
    let server = TestRelayServer::spawn().await.unwrap();
    server.directory().with_room(ROOM, "alice", Some("hunter2"), 10);

    let mut bob = authed(&server, "bob", "Bob").await;
    assert!(bob.join(ROOM, Some("wrong")).await.is_err());
    assert!(bob.join(ROOM, Some("hunter2")).await.is_ok());
}

// ============================================================================
// Leaving
// ============================================================================

#[tokio::test]
async fn test_disconnect_removes_member_and_notifies_room() {
    let server = TestRelayServer::spawn().await.unwrap();
    server.directory().with_room(ROOM, "alice", None, 10);

    let mut alice = authed(&server, "alice", "Alice").await;
    let mut bob = authed(&server, "bob", "Bob").await;
    alice.join(ROOM, None).await.unwrap();
    bob.join(ROOM, None).await.unwrap();
    alice
        .recv_until(|e| matches!(e, ServerEvent::UserJoined { .. }))
        .await
        .unwrap();

    drop(bob);

    assert_eq!(
        alice.recv().await.unwrap(),
        ServerEvent::UserLeft {
            room: RoomSlug::from(ROOM),
            user_id: UserId::from("bob"),
        }
    );
    assert_eq!(room_members(&server, ROOM).await, vec![UserId::from("alice")]);
}

#[tokio::test]
async fn test_last_leave_releases_room() {
    let server = TestRelayServer::spawn().await.unwrap();
    server.directory().with_room(ROOM, "alice", None, 10);

    let mut alice = authed(&server, "alice", "Alice").await;
    alice.join(ROOM, None).await.unwrap();
    alice
        .send(&ClientMessage::Leave {
            room: RoomSlug::from(ROOM),
        })
        .await
        .unwrap();

    let mut released = false;
    for _ in 0..50 {
        let status = server.controller().get_status().await.unwrap();
        if status.active_rooms == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released);
    assert!(room_members(&server, ROOM).await.is_empty());
}

// ============================================================================
// Host actions and chat
// ============================================================================

#[tokio::test]
async fn test_host_kicks_participant() {
    let server = TestRelayServer::spawn().await.unwrap();
    server.directory().with_room(ROOM, "alice", None, 10);

    let mut alice = authed(&server, "alice", "Alice").await;
    let mut bob = authed(&server, "bob", "Bob").await;
    alice.join(ROOM, None).await.unwrap();
    bob.join(ROOM, None).await.unwrap();
    alice
        .recv_until(|e| matches!(e, ServerEvent::UserJoined { .. }))
        .await
        .unwrap();

    // Non-host cannot kick
    bob.recv_until(|e| matches!(e, ServerEvent::RequestOffers { .. }))
        .await
        .unwrap();
    bob.send(&ClientMessage::Kick {
        room: RoomSlug::from(ROOM),
        target: UserId::from("alice"),
    })
    .await
    .unwrap();
    let ServerEvent::Error { code, .. } = bob.recv().await.unwrap() else {
        panic!("expected error");
    };
    assert_eq!(code, error_codes::FORBIDDEN);

    alice
        .send(&ClientMessage::Kick {
            room: RoomSlug::from(ROOM),
            target: UserId::from("bob"),
        })
        .await
        .unwrap();

    assert_eq!(
        bob.recv().await.unwrap(),
        ServerEvent::Kicked {
            room: RoomSlug::from(ROOM)
        }
    );
    assert_eq!(
        alice.recv().await.unwrap(),
        ServerEvent::UserLeft {
            room: RoomSlug::from(ROOM),
            user_id: UserId::from("bob"),
        }
    );
    assert_eq!(room_members(&server, ROOM).await, vec![UserId::from("alice")]);
}

#[tokio::test]
async fn test_host_transfer_is_persisted_and_broadcast() {
    let server = TestRelayServer::spawn().await.unwrap();
    server.directory().with_room(ROOM, "alice", None, 10);

    let mut alice = authed(&server, "alice", "Alice").await;
    let mut bob = authed(&server, "bob", "Bob").await;
    alice.join(ROOM, None).await.unwrap();
    bob.join(ROOM, None).await.unwrap();

    alice
        .send(&ClientMessage::TransferHost {
            room: RoomSlug::from(ROOM),
            target: UserId::from("bob"),
        })
        .await
        .unwrap();

    for client in [&mut alice, &mut bob] {
        let event = client
            .recv_until(|e| matches!(e, ServerEvent::HostChanged { .. }))
            .await
            .unwrap();
        let ServerEvent::HostChanged {
            new_host_id,
            new_host_name,
            ..
        } = event
        else {
            panic!("expected host-changed");
        };
        assert_eq!(new_host_id, UserId::from("bob"));
        assert_eq!(new_host_name, "Bob");
    }
    assert_eq!(server.directory().host_of(ROOM), Some(UserId::from("bob")));
}

#[tokio::test]
async fn test_chat_is_stored_and_broadcast() {
    let server = TestRelayServer::spawn().await.unwrap();
    server.directory().with_room(ROOM, "alice", None, 10);

    let mut alice = authed(&server, "alice", "Alice").await;
    let mut bob = authed(&server, "bob", "Bob").await;
    alice.join(ROOM, None).await.unwrap();
    bob.join(ROOM, None).await.unwrap();

    bob.send(&ClientMessage::ChatSend {
        room: RoomSlug::from(ROOM),
        text: "  hello  ".to_string(),
        reply_to: None,
    })
    .await
    .unwrap();

    let ServerEvent::ChatResponse {
        success, message, ..
    } = bob
        .recv_until(|e| matches!(e, ServerEvent::ChatResponse { .. }))
        .await
        .unwrap()
    else {
        panic!("expected chat-response");
    };
    assert!(success);
    let stored = message.unwrap();

    let ServerEvent::ChatMessage { message, .. } = alice
        .recv_until(|e| matches!(e, ServerEvent::ChatMessage { .. }))
        .await
        .unwrap()
    else {
        panic!("expected chat-message");
    };
    assert_eq!(message.id, stored.id);
    assert_eq!(message.user.id, UserId::from("bob"));
    assert_eq!(server.chat_log().messages().len(), 1);
}
