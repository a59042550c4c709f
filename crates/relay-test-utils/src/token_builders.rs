//! Builder patterns for test access tokens.

use chrono::{Duration, Utc};
use common::jwt::UserClaims;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};

/// HS256 secret shared by [`TestTokenBuilder`] and the test server.
pub const TEST_JWT_SECRET: &str = "relay-test-utils-hs256-signing-secret";

/// Builder for signed test access tokens.
///
/// # Example
/// ```rust,ignore
/// let token = TestTokenBuilder::new()
///     .for_user("alice")
///     .expires_in(3600)
///     .build();
/// ```
pub struct TestTokenBuilder {
    sub: String,
    token_version: u32,
    exp: i64,
    iat: i64,
    secret: String,
}

impl TestTokenBuilder {
    /// Create a new token builder with defaults
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            sub: "test-user".to_string(),
            token_version: 0,
            exp: (now + Duration::seconds(3600)).timestamp(),
            iat: now.timestamp(),
            secret: TEST_JWT_SECRET.to_string(),
        }
    }

    /// Set the subject user ID
    pub fn for_user(mut self, user_id: &str) -> Self {
        self.sub = user_id.to_string();
        self
    }

    pub fn token_version(mut self, version: u32) -> Self {
        self.token_version = version;
        self
    }

    /// Set expiration in seconds from now (negative for an expired token)
    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.exp = (Utc::now() + Duration::seconds(seconds)).timestamp();
        self
    }

    /// Set issued-at timestamp
    pub fn issued_at(mut self, timestamp: i64) -> Self {
        self.iat = timestamp;
        self
    }

    /// Sign with a different secret (for signature failure tests)
    pub fn signed_with(mut self, secret: &str) -> Self {
        self.secret = secret.to_string();
        self
    }

    /// Sign and encode the token
    pub fn build(self) -> String {
        let claims = UserClaims::new(self.sub, self.token_version, self.exp, self.iat);
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .expect("token encoding failed")
    }
}

impl Default for TestTokenBuilder {
    fn default() -> Self {
        Self::new()
    }
}
