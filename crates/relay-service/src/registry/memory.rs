//! Process-local session registry.

use super::{ParticipantPatch, RegisteredParticipant, SessionRegistry};
use crate::errors::RelayError;
use async_trait::async_trait;
use common::types::{RoomSlug, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct Entry {
    participant: RegisteredParticipant,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<RoomSlug, HashMap<UserId, Entry>>,
    user_rooms: HashMap<UserId, HashSet<RoomSlug>>,
}

impl Inner {
    fn unlink(&mut self, room: &RoomSlug, user_id: &UserId) {
        if let Some(rooms) = self.user_rooms.get_mut(user_id) {
            rooms.remove(room);
            if rooms.is_empty() {
                self.user_rooms.remove(user_id);
            }
        }
    }

    /// Remove one entry, dropping the room once it is empty.
    fn remove(&mut self, room: &RoomSlug, user_id: &UserId) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let existed = members.remove(user_id).is_some();
        if members.is_empty() {
            self.rooms.remove(room);
        }
        self.unlink(room, user_id);
        existed
    }

    /// Drop expired entries of one room.
    fn prune_room(&mut self, room: &RoomSlug, now: Instant) -> usize {
        let expired: Vec<UserId> = match self.rooms.get(room) {
            Some(members) => members
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(user_id, _)| user_id.clone())
                .collect(),
            None => return 0,
        };
        for user_id in &expired {
            self.remove(room, user_id);
        }
        expired.len()
    }

    /// Live entry for `(room, user_id)`, treating expired entries as absent.
    fn live_entry(&mut self, room: &RoomSlug, user_id: &UserId, now: Instant) -> Option<&mut Entry> {
        self.prune_room(room, now);
        self.rooms.get_mut(room)?.get_mut(user_id)
    }
}

/// In-memory [`SessionRegistry`] with per-entry expiry.
///
/// Expired entries are invisible to reads immediately; the sweeper task
/// reclaims their memory for rooms nobody reads any more.
pub struct InMemoryRegistry {
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl InMemoryRegistry {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Remove every expired entry. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let rooms: Vec<RoomSlug> = inner.rooms.keys().cloned().collect();
        rooms.iter().map(|room| inner.prune_room(room, now)).sum()
    }

    /// Spawn a task that calls [`Self::sweep`] every `interval` until cancelled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        info!(target: "relay.registry.memory", "Registry sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = self.sweep().await;
                        if removed > 0 {
                            debug!(
                                target: "relay.registry.memory",
                                removed = removed,
                                "Expired participant records removed"
                            );
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl SessionRegistry for InMemoryRegistry {
    async fn add_participant(
        &self,
        room: &RoomSlug,
        participant: RegisteredParticipant,
    ) -> Result<(), RelayError> {
        let expires_at = Instant::now() + self.ttl;
        let user_id = participant.user_id().clone();
        let mut inner = self.inner.lock().await;

        inner.rooms.entry(room.clone()).or_default().insert(
            user_id.clone(),
            Entry {
                participant,
                expires_at,
            },
        );
        inner
            .user_rooms
            .entry(user_id)
            .or_default()
            .insert(room.clone());
        Ok(())
    }

    async fn remove_participant(
        &self,
        room: &RoomSlug,
        user_id: &UserId,
    ) -> Result<bool, RelayError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let live = inner.live_entry(room, user_id, now).is_some();
        let removed = inner.remove(room, user_id);
        Ok(live && removed)
    }

    async fn list_participants(
        &self,
        room: &RoomSlug,
    ) -> Result<Vec<RegisteredParticipant>, RelayError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.prune_room(room, now);
        Ok(inner
            .rooms
            .get(room)
            .map(|members| members.values().map(|e| e.participant.clone()).collect())
            .unwrap_or_default())
    }

    async fn update_participant(
        &self,
        room: &RoomSlug,
        user_id: &UserId,
        patch: &ParticipantPatch,
    ) -> Result<Option<RegisteredParticipant>, RelayError> {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.live_entry(room, user_id, now) else {
            return Ok(None);
        };
        entry.participant.apply(patch);
        entry.expires_at = now + ttl;
        Ok(Some(entry.participant.clone()))
    }

    async fn refresh(&self, room: &RoomSlug, user_id: &UserId) -> Result<bool, RelayError> {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut inner = self.inner.lock().await;
        match inner.live_entry(room, user_id, now) {
            Some(entry) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn rooms_for_user(&self, user_id: &UserId) -> Result<Vec<RoomSlug>, RelayError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let rooms: Vec<RoomSlug> = inner
            .user_rooms
            .get(user_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default();
        Ok(rooms
            .into_iter()
            .filter(|room| inner.live_entry(room, user_id, now).is_some())
            .collect())
    }
}
