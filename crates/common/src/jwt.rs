//! JWT helpers shared by the relay's credential validator and its tests.
//!
//! This module holds the pieces of user-token validation that do not depend
//! on a signing algorithm:
//! - Size limit checked before any parsing
//! - Clock skew constants and `iat` validation
//! - The user credential claims structure
//!
//! Signature and `exp` verification live next to the signing key in the relay.
//! All errors render the same generic message; detailed reasons are logged at
//! debug level under the `common.jwt` target.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum accepted credential size in bytes (8KB).
///
/// Typical user tokens are 200-400 bytes. Anything larger is rejected before
/// base64 decoding or signature work is attempted.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Default clock skew tolerance for `iat` (5 minutes).
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Upper bound for a configured clock skew tolerance (10 minutes).
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during credential validation.
///
/// Every variant displays the same message so a client cannot distinguish
/// an expired token from a forged one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds maximum allowed.
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Token is empty or structurally invalid.
    #[error("The access token is invalid or expired")]
    MalformedToken,

    /// Signature or `exp` verification failed.
    #[error("The access token is invalid or expired")]
    VerificationFailed,

    /// Token `iat` claim is too far in the future.
    #[error("The access token is invalid or expired")]
    IatTooFarInFuture,
}

// =============================================================================
// Claims Types
// =============================================================================

/// Claims carried by a user credential.
///
/// `token_version` is bumped by the account service on logout-everywhere or
/// password change; a token whose version no longer matches the account is
/// treated as revoked. `sub` is redacted in Debug output.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserClaims {
    /// Subject (user ID).
    pub sub: String,

    /// Account token version at issue time.
    #[serde(rename = "tokenVersion", alias = "token_version", default)]
    pub token_version: u32,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Issued-at timestamp (Unix epoch seconds).
    pub iat: i64,
}

impl fmt::Debug for UserClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserClaims")
            .field("sub", &"[REDACTED]")
            .field("token_version", &self.token_version)
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .finish()
    }
}

impl UserClaims {
    /// Creates a new `UserClaims` instance.
    #[must_use]
    pub fn new(sub: impl Into<String>, token_version: u32, exp: i64, iat: i64) -> Self {
        Self {
            sub: sub.into(),
            token_version,
            exp,
            iat,
        }
    }
}

// =============================================================================
// Functions
// =============================================================================

/// Reject empty or oversized tokens before any decoding happens.
///
/// # Errors
///
/// - `MalformedToken` for an empty token or one without three segments
/// - `TokenTooLarge` when the token exceeds [`MAX_JWT_SIZE_BYTES`]
pub fn check_token_shape(token: &str) -> Result<(), JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }

    if token.is_empty() || token.split('.').count() != 3 {
        tracing::debug!(target: "common.jwt", "Token rejected: invalid JWT format");
        return Err(JwtValidationError::MalformedToken);
    }

    Ok(())
}

/// Validate the `iat` (issued-at) claim with clock skew tolerance.
///
/// # Errors
///
/// Returns `JwtValidationError::IatTooFarInFuture` if the iat timestamp is more than
/// `clock_skew` in the future.
pub fn validate_iat(iat: i64, clock_skew: Duration) -> Result<(), JwtValidationError> {
    let now = chrono::Utc::now().timestamp();
    validate_iat_at(iat, clock_skew, now)
}

/// Deterministic `iat` validation against an explicit `now` timestamp.
pub(crate) fn validate_iat_at(
    iat: i64,
    clock_skew: Duration,
    now: i64,
) -> Result<(), JwtValidationError> {
    let clock_skew_secs = i64::try_from(clamp_clock_skew(clock_skew).as_secs()).unwrap_or(0);
    let max_iat = now.saturating_add(clock_skew_secs);

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat = iat,
            now = now,
            max_allowed = max_iat,
            clock_skew_secs = clock_skew_secs,
            "Token rejected: iat too far in the future"
        );
        return Err(JwtValidationError::IatTooFarInFuture);
    }

    Ok(())
}

/// Clamp a configured clock skew to [`MAX_CLOCK_SKEW`].
#[must_use]
pub fn clamp_clock_skew(clock_skew: Duration) -> Duration {
    clock_skew.min(MAX_CLOCK_SKEW)
}
