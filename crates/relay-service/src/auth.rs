//! Credential validation for relay connections.
//!
//! A connection authenticates once with an HS256 access token. Checks run in
//! this order and stop at the first failure:
//!
//! 1. Size and shape check (before any parsing)
//! 2. Token not revoked
//! 3. Signature and `exp`
//! 4. `iat` within the clock skew window
//! 5. Account exists and is active
//! 6. `tokenVersion` matches the account
//!
//! Every failure surfaces to the client as the same generic auth error. The
//! concrete reason is only logged at debug level.

use crate::errors::RelayError;
use async_trait::async_trait;
use common::jwt::{check_token_shape, validate_iat, UserClaims};
use common::secret::{ExposeSecret, SecretString};
use common::types::UserId;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Authenticated identity bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// Account fields the relay needs at authentication time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub is_active: bool,
    pub token_version: u32,
}

/// Read access to accounts and revoked tokens.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// True if the token was explicitly revoked (logout).
    async fn is_token_revoked(&self, token: &str) -> Result<bool, RelayError>;

    /// Look up an account by ID.
    async fn find_account(&self, user_id: &UserId) -> Result<Option<Account>, RelayError>;
}

/// Turns a bearer credential into an [`Identity`].
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    /// Verify a token.
    ///
    /// # Errors
    ///
    /// `RelayError::Auth` for any rejected credential; store failures pass
    /// through unchanged.
    async fn verify(&self, token: &str) -> Result<Identity, RelayError>;
}

/// HS256 token validator backed by an [`AccountStore`].
pub struct JwtCredentialValidator {
    decoding_key: DecodingKey,
    clock_skew: Duration,
    accounts: Arc<dyn AccountStore>,
}

impl fmt::Debug for JwtCredentialValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtCredentialValidator")
            .field("decoding_key", &"[REDACTED]")
            .field("clock_skew", &self.clock_skew)
            .finish_non_exhaustive()
    }
}

impl JwtCredentialValidator {
    /// Create a validator for tokens signed with `secret`.
    #[must_use]
    pub fn new(secret: &SecretString, clock_skew: Duration, accounts: Arc<dyn AccountStore>) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            clock_skew,
            accounts,
        }
    }

    fn decode_claims(&self, token: &str) -> Result<UserClaims, RelayError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.required_spec_claims.clear();
        validation.required_spec_claims.insert("exp".to_string());

        let data = decode::<UserClaims>(token, &self.decoding_key, &validation).map_err(|e| {
            tracing::debug!(target: "relay.auth", error = %e, "Token verification failed");
            RelayError::Auth("signature or expiry".to_string())
        })?;

        Ok(data.claims)
    }
}

#[async_trait]
impl CredentialValidator for JwtCredentialValidator {
    #[instrument(skip_all, name = "relay.auth.verify")]
    async fn verify(&self, token: &str) -> Result<Identity, RelayError> {
        check_token_shape(token).map_err(|e| {
            tracing::debug!(target: "relay.auth", error = ?e, "Token shape check failed");
            RelayError::Auth("token shape".to_string())
        })?;

        if self.accounts.is_token_revoked(token).await? {
            tracing::debug!(target: "relay.auth", "Token is revoked");
            return Err(RelayError::Auth("token revoked".to_string()));
        }

        let claims = self.decode_claims(token)?;

        if let Err(e) = validate_iat(claims.iat, self.clock_skew) {
            tracing::debug!(target: "relay.auth", error = ?e, "Token iat validation failed");
            return Err(RelayError::Auth("iat outside skew window".to_string()));
        }

        let user_id = UserId::new(claims.sub);
        let Some(account) = self.accounts.find_account(&user_id).await? else {
            tracing::debug!(target: "relay.auth", user_id = %user_id, "Account not found");
            return Err(RelayError::Auth("account not found".to_string()));
        };

        if !account.is_active {
            tracing::debug!(target: "relay.auth", user_id = %user_id, "Account is deactivated");
            return Err(RelayError::Auth("account inactive".to_string()));
        }

        if account.token_version != claims.token_version {
            tracing::debug!(
                target: "relay.auth",
                user_id = %user_id,
                token_version = claims.token_version,
                account_version = account.token_version,
                "Token version mismatch"
            );
            return Err(RelayError::Auth("token version mismatch".to_string()));
        }

        tracing::debug!(target: "relay.auth", user_id = %user_id, "Token validated successfully");
        Ok(Identity {
            user_id,
            display_name: account.display_name,
            avatar_url: account.avatar_url,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::collections::{HashMap, HashSet};

    const SECRET: &str = "unit-test-signing-secret";

    #[derive(Default)]
    struct FakeAccounts {
        revoked: HashSet<String>,
        accounts: HashMap<UserId, Account>,
    }

    #[async_trait]
    impl AccountStore for FakeAccounts {
        async fn is_token_revoked(&self, token: &str) -> Result<bool, RelayError> {
            Ok(self.revoked.contains(token))
        }

        async fn find_account(&self, user_id: &UserId) -> Result<Option<Account>, RelayError> {
            Ok(self.accounts.get(user_id).cloned())
        }
    }

    fn alice_account(token_version: u32, is_active: bool) -> Account {
        Account {
            display_name: "Alice".to_string(),
            avatar_url: None,
            is_active,
            token_version,
        }
    }

    fn mint(sub: &str, token_version: u32, exp_offset: i64, iat_offset: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = UserClaims::new(sub, token_version, now + exp_offset, now + iat_offset);
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn validator(accounts: FakeAccounts) -> JwtCredentialValidator {
        JwtCredentialValidator::new(
            &SecretString::from(SECRET.to_string()),
            Duration::from_secs(300),
            Arc::new(accounts),
        )
    }

    fn with_alice(token_version: u32, is_active: bool) -> FakeAccounts {
        let mut accounts = FakeAccounts::default();
        accounts
            .accounts
            .insert(UserId::from("alice"), alice_account(token_version, is_active));
        accounts
    }

    #[tokio::test]
    async fn test_valid_token_yields_identity() {
        let identity = validator(with_alice(1, true))
            .verify(&mint("alice", 1, 3600, 0))
            .await
            .unwrap();

        assert_eq!(identity.user_id, UserId::from("alice"));
        assert_eq!(identity.display_name, "Alice");
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let result = validator(with_alice(1, true))
            .verify(&mint("alice", 1, -3600, -7200))
            .await;
        assert!(matches!(result, Err(RelayError::Auth(_))));
    }

    #[tokio::test]
    async fn test_wrong_signature_rejected() {
        let now = chrono::Utc::now().timestamp();
        let token = encode(
            &Header::new(Algorithm::HS256),
            &UserClaims::new("alice", 1, now + 3600, now),
            &EncodingKey::from_secret(b"some-other-secret"),
        )
        .unwrap();

        let result = validator(with_alice(1, true)).verify(&token).await;
        assert!(matches!(result, Err(RelayError::Auth(_))));
    }

    #[tokio::test]
    async fn test_iat_in_future_rejected() {
        let result = validator(with_alice(1, true))
            .verify(&mint("alice", 1, 7200, 3600))
            .await;
        assert!(matches!(result, Err(RelayError::Auth(_))));
    }

    #[tokio::test]
    async fn test_revoked_token_rejected() {
        let token = mint("alice", 1, 3600, 0);
        let mut accounts = with_alice(1, true);
        accounts.revoked.insert(token.clone());

        let result = validator(accounts).verify(&token).await;
        assert!(matches!(result, Err(RelayError::Auth(reason)) if reason == "token revoked"));
    }

    #[tokio::test]
    async fn test_unknown_account_rejected() {
        let result = validator(FakeAccounts::default())
            .verify(&mint("alice", 1, 3600, 0))
            .await;
        assert!(matches!(result, Err(RelayError::Auth(_))));
    }

    #[tokio::test]
    async fn test_inactive_account_rejected() {
        let result = validator(with_alice(1, false))
            .verify(&mint("alice", 1, 3600, 0))
            .await;
        assert!(matches!(result, Err(RelayError::Auth(reason)) if reason == "account inactive"));
    }

    #[tokio::test]
    async fn test_stale_token_version_rejected() {
        let result = validator(with_alice(2, true))
            .verify(&mint("alice", 1, 3600, 0))
            .await;
        assert!(matches!(result, Err(RelayError::Auth(reason)) if reason == "token version mismatch"));
    }

    #[tokio::test]
    async fn test_oversized_token_rejected_before_decoding() {
        let token = format!("{}.b.c", "a".repeat(common::jwt::MAX_JWT_SIZE_BYTES));
        let result = validator(with_alice(1, true)).verify(&token).await;
        assert!(matches!(result, Err(RelayError::Auth(reason)) if reason == "token shape"));
    }

    #[tokio::test]
    async fn test_all_failures_share_client_message() {
        let err = validator(FakeAccounts::default())
            .verify("not-a-token")
            .await
            .unwrap_err();
        assert_eq!(err.client_message(), "Authentication failed");
        assert_eq!(err.error_code(), 2);
    }

    #[test]
    fn test_debug_redacts_key() {
        let debug = format!("{:?}", validator(FakeAccounts::default()));
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains(SECRET));
    }
}
