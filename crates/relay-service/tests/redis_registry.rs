//! Redis session registry behaviour against a live Redis.
//!
//! These need a Redis server and are ignored by default:
//!
//! ```text
//! RELAY_TEST_REDIS_URL=redis://127.0.0.1:6379 cargo test -p relay-service --test redis_registry -- --ignored
//! ```
//!
//! Every test works in its own room and user IDs, so runs can share a server.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use chrono::Utc;
use common::types::{ConnectionId, RoomSlug, UserId};
use redis::AsyncCommands;
use relay_service::redis::{RedisConnection, RedisSessionRegistry};
use relay_service::registry::{ParticipantPatch, RegisteredParticipant, SessionRegistry};
use signaling_protocol::{MediaFlagsPatch, ParticipantSnapshot};
use uuid::Uuid;

const TTL: Duration = Duration::from_secs(60);

fn redis_url() -> String {
    std::env::var("RELAY_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

struct Fixture {
    registry: RedisSessionRegistry,
    raw: redis::aio::MultiplexedConnection,
    room: RoomSlug,
    tag: String,
}

impl Fixture {
    async fn new(ttl: Duration) -> Self {
        let url = redis_url();
        let connection = RedisConnection::connect(&url).await.unwrap();
        let raw = redis::Client::open(url.as_str())
            .unwrap()
            .get_multiplexed_async_connection()
            .await
            .unwrap();
        let tag = Uuid::new_v4().simple().to_string();
        Self {
            registry: RedisSessionRegistry::new(connection, ttl),
            raw,
            room: RoomSlug::new(format!("room-{tag}")),
            tag,
        }
    }

    fn user(&self, name: &str) -> UserId {
        UserId::from(format!("{name}-{}", self.tag).as_str())
    }

    fn participant(&self, name: &str) -> RegisteredParticipant {
        RegisteredParticipant {
            snapshot: ParticipantSnapshot {
                user_id: self.user(name),
                display_name: name.to_string(),
                avatar_url: None,
                muted: false,
                camera_off: true,
                screen_sharing: false,
                is_host: false,
            },
            connection_id: ConnectionId::new(),
            joined_at: Utc::now(),
        }
    }

    async fn key_exists(&mut self, key: String) -> bool {
        self.raw.exists(key).await.unwrap()
    }
}

fn mute() -> ParticipantPatch {
    ParticipantPatch::media(MediaFlagsPatch {
        muted: Some(true),
        ..MediaFlagsPatch::default()
    })
}

#[tokio::test]
#[ignore = "needs a Redis server at RELAY_TEST_REDIS_URL"]
async fn test_update_absent_participant_writes_nothing() {
    let mut f = Fixture::new(TTL).await;
    let ghost = f.user("ghost");

    let updated = f
        .registry
        .update_participant(&f.room, &ghost, &mute())
        .await
        .unwrap();

    assert!(updated.is_none());
    assert!(f.registry.list_participants(&f.room).await.unwrap().is_empty());
    let record_key = format!("participant:{}:{ghost}", f.room);
    assert!(!f.key_exists(record_key).await);
}

#[tokio::test]
#[ignore = "needs a Redis server at RELAY_TEST_REDIS_URL"]
async fn test_late_update_does_not_resurrect_removed_participant() {
    let f = Fixture::new(TTL).await;
    let alice = f.user("alice");
    f.registry
        .add_participant(&f.room, f.participant("alice"))
        .await
        .unwrap();

    assert!(f.registry.remove_participant(&f.room, &alice).await.unwrap());
    let updated = f
        .registry
        .update_participant(&f.room, &alice, &mute())
        .await
        .unwrap();

    assert!(updated.is_none());
    assert!(f.registry.list_participants(&f.room).await.unwrap().is_empty());
    assert!(f.registry.rooms_for_user(&alice).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "needs a Redis server at RELAY_TEST_REDIS_URL"]
async fn test_removing_last_member_deletes_room() {
    let mut f = Fixture::new(TTL).await;
    let alice = f.user("alice");
    let bob = f.user("bob");
    f.registry
        .add_participant(&f.room, f.participant("alice"))
        .await
        .unwrap();
    f.registry
        .add_participant(&f.room, f.participant("bob"))
        .await
        .unwrap();
    let room_key = format!("room:{}", f.room);

    assert!(f.registry.remove_participant(&f.room, &alice).await.unwrap());
    assert!(f.key_exists(room_key.clone()).await);

    assert!(f.registry.remove_participant(&f.room, &bob).await.unwrap());
    assert!(!f.key_exists(room_key).await);
    assert!(!f.registry.remove_participant(&f.room, &bob).await.unwrap());
}

#[tokio::test]
#[ignore = "needs a Redis server at RELAY_TEST_REDIS_URL"]
async fn test_update_merges_only_present_fields() {
    let f = Fixture::new(TTL).await;
    let alice = f.user("alice");
    f.registry
        .add_participant(&f.room, f.participant("alice"))
        .await
        .unwrap();

    let updated = f
        .registry
        .update_participant(&f.room, &alice, &mute())
        .await
        .unwrap()
        .expect("record exists");

    assert!(updated.snapshot.muted);
    assert!(updated.snapshot.camera_off);
    assert_eq!(updated.snapshot.display_name, "alice");

    let listed = f.registry.list_participants(&f.room).await.unwrap();
    assert_eq!(listed, vec![updated]);
}

#[tokio::test]
#[ignore = "needs a Redis server at RELAY_TEST_REDIS_URL"]
async fn test_expired_records_disappear_from_reads() {
    let mut f = Fixture::new(Duration::from_secs(1)).await;
    let alice = f.user("alice");
    f.registry
        .add_participant(&f.room, f.participant("alice"))
        .await
        .unwrap();
    assert_eq!(f.registry.rooms_for_user(&alice).await.unwrap(), vec![f.room.clone()]);

    tokio::time::sleep(Duration::from_millis(2100)).await;

    assert!(f.registry.list_participants(&f.room).await.unwrap().is_empty());
    assert!(f.registry.rooms_for_user(&alice).await.unwrap().is_empty());
    assert!(!f.registry.refresh(&f.room, &alice).await.unwrap());
    let room_key = format!("room:{}", f.room);
    assert!(!f.key_exists(room_key).await);
}
