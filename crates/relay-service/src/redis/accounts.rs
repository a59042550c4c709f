//! Redis-backed account store.
//!
//! - `blacklist:token:{token}` - present while a logged-out token is still unexpired
//! - `user:{id}` - hash with `display_name`, `avatar_url`, `is_active`, `token_version`

use super::client::RedisConnection;
use crate::auth::{Account, AccountStore};
use crate::errors::RelayError;
use async_trait::async_trait;
use common::types::UserId;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{instrument, warn};

fn account_from_fields(fields: &HashMap<String, String>) -> Option<Account> {
    let display_name = fields.get("display_name")?.clone();
    Some(Account {
        display_name,
        avatar_url: fields.get("avatar_url").filter(|u| !u.is_empty()).cloned(),
        is_active: fields
            .get("is_active")
            .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true")),
        token_version: fields
            .get("token_version")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
    })
}

#[derive(Clone)]
pub struct RedisAccountStore {
    redis: RedisConnection,
}

impl RedisAccountStore {
    #[must_use]
    pub fn new(redis: RedisConnection) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl AccountStore for RedisAccountStore {
    #[instrument(skip_all)]
    async fn is_token_revoked(&self, token: &str) -> Result<bool, RelayError> {
        let mut conn = self.redis.conn();
        conn.exists(format!("blacklist:token:{token}"))
            .await
            .map_err(|e| {
                warn!(target: "relay.redis.accounts", error = %e, "Failed to check token blacklist");
                RelayError::Redis(format!("Failed to check token blacklist: {e}"))
            })
    }

    #[instrument(skip_all, fields(user_id = %user_id))]
    async fn find_account(&self, user_id: &UserId) -> Result<Option<Account>, RelayError> {
        let mut conn = self.redis.conn();
        let fields: HashMap<String, String> =
            conn.hgetall(format!("user:{user_id}")).await.map_err(|e| {
                warn!(target: "relay.redis.accounts", error = %e, user_id = %user_id, "Failed to read account");
                RelayError::Redis(format!("Failed to read account: {e}"))
            })?;

        Ok(account_from_fields(&fields))
    }
}
