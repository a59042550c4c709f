//! In-memory collaborator stores.
//!
//! Each mock is a cheap `Clone` over shared state, so a test can keep one
//! copy for assertions while the relay owns another.

use async_trait::async_trait;
use chrono::Utc;
use common::types::{RoomSlug, UserId};
use relay_service::auth::{Account, AccountStore};
use relay_service::chat::PersistentChatLog;
use relay_service::directory::{RoomDirectory, RoomRecord};
use relay_service::errors::RelayError;
use signaling_protocol::{ChatAuthor, ChatMessage};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// bcrypt cost used for fixture passwords. Low to keep tests fast.
pub const TEST_BCRYPT_COST: u32 = 4;

/// Mock room directory.
#[derive(Debug, Clone, Default)]
pub struct MockRoomDirectory {
    rooms: Arc<Mutex<HashMap<RoomSlug, RoomRecord>>>,
}

impl MockRoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a room. `password` is hashed with bcrypt.
    pub fn with_room(
        &self,
        slug: &str,
        host: &str,
        password: Option<&str>,
        max_participants: u32,
    ) -> &Self {
        let password_hash =
            password.map(|p| bcrypt::hash(p, TEST_BCRYPT_COST).expect("bcrypt hash failed"));
        self.rooms.lock().unwrap().insert(
            RoomSlug::from(slug),
            RoomRecord {
                host_id: UserId::from(host),
                password_hash,
                max_participants,
            },
        );
        self
    }

    /// Current host of a room, as persisted by host transfers.
    pub fn host_of(&self, slug: &str) -> Option<UserId> {
        self.rooms
            .lock()
            .unwrap()
            .get(&RoomSlug::from(slug))
            .map(|r| r.host_id.clone())
    }
}

#[async_trait]
impl RoomDirectory for MockRoomDirectory {
    async fn find_by_slug(&self, room: &RoomSlug) -> Result<Option<RoomRecord>, RelayError> {
        Ok(self.rooms.lock().unwrap().get(room).cloned())
    }

    async fn update_host(&self, room: &RoomSlug, new_host: &UserId) -> Result<(), RelayError> {
        let mut rooms = self.rooms.lock().unwrap();
        let record = rooms
            .get_mut(room)
            .ok_or_else(|| RelayError::RoomNotFound(room.to_string()))?;
        record.host_id = new_host.clone();
        Ok(())
    }
}

/// Mock account store.
#[derive(Debug, Clone, Default)]
pub struct MockAccountStore {
    inner: Arc<Mutex<MockAccountsInner>>,
}

#[derive(Debug, Default)]
struct MockAccountsInner {
    accounts: HashMap<UserId, Account>,
    revoked: HashSet<String>,
}

impl MockAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an active account with token version 0.
    pub fn with_user(&self, user_id: &str, display_name: &str) -> &Self {
        self.with_account(
            user_id,
            Account {
                display_name: display_name.to_string(),
                avatar_url: None,
                is_active: true,
                token_version: 0,
            },
        )
    }

    pub fn with_account(&self, user_id: &str, account: Account) -> &Self {
        self.inner
            .lock()
            .unwrap()
            .accounts
            .insert(UserId::from(user_id), account);
        self
    }

    pub fn revoke(&self, token: &str) {
        self.inner.lock().unwrap().revoked.insert(token.to_string());
    }
}

#[async_trait]
impl AccountStore for MockAccountStore {
    async fn is_token_revoked(&self, token: &str) -> Result<bool, RelayError> {
        Ok(self.inner.lock().unwrap().revoked.contains(token))
    }

    async fn find_account(&self, user_id: &UserId) -> Result<Option<Account>, RelayError> {
        Ok(self.inner.lock().unwrap().accounts.get(user_id).cloned())
    }
}

/// Mock chat log.
#[derive(Debug, Clone, Default)]
pub struct MockChatLog {
    messages: Arc<Mutex<Vec<ChatMessage>>>,
}

impl MockChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored message, in append order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl PersistentChatLog for MockChatLog {
    async fn append(
        &self,
        room: &RoomSlug,
        author: ChatAuthor,
        text: String,
        reply_to: Option<Uuid>,
    ) -> Result<ChatMessage, RelayError> {
        let message = ChatMessage {
            id: Uuid::new_v4(),
            room: room.clone(),
            text,
            created_at: Utc::now(),
            user: author,
            reply_to,
        };
        self.messages.lock().unwrap().push(message.clone());
        Ok(message)
    }

    async fn recent(&self, room: &RoomSlug, limit: usize) -> Result<Vec<ChatMessage>, RelayError> {
        let messages = self.messages.lock().unwrap();
        let in_room: Vec<ChatMessage> = messages
            .iter()
            .filter(|m| &m.room == room)
            .cloned()
            .collect();
        let skip = in_room.len().saturating_sub(limit);
        Ok(in_room.into_iter().skip(skip).collect())
    }
}
