//! Secret types for values that must never reach a log line.
//!
//! Re-exports the [`secrecy`] types used across the workspace. The relay keeps
//! its JWT signing secret, the Redis URL (which may embed a password) and the
//! TURN credential in `SecretString`; the client keeps its bearer token there.
//!
//! `Debug` on these types prints a redaction marker, so deriving `Debug` on a
//! struct that holds one stays safe. Reading the value requires an explicit
//! `expose_secret()` call.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct TurnCredentials {
//!     username: String,
//!     credential: SecretString,
//! }
//!
//! let creds = TurnCredentials {
//!     username: "relay".to_string(),
//!     credential: SecretString::from("s3cret"),
//! };
//!
//! assert!(!format!("{creds:?}").contains("s3cret"));
//! assert_eq!(creds.credential.expose_secret(), "s3cret");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("bearer-token");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("bearer-token"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("jwt-signing-key");
        assert_eq!(secret.expose_secret(), "jwt-signing-key");
    }

    #[test]
    fn test_deserialized_secret_stays_redacted() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct IceCredentials {
            username: String,
            credential: SecretString,
        }

        let json = r#"{"username": "turn-user", "credential": "turn-pass"}"#;
        let creds: IceCredentials = serde_json::from_str(json).expect("deserialize");

        assert_eq!(creds.credential.expose_secret(), "turn-pass");

        let debug = format!("{creds:?}");
        assert!(debug.contains("turn-user"));
        assert!(!debug.contains("turn-pass"));
    }
}
