//! Relay configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::jwt::{clamp_clock_skew, DEFAULT_CLOCK_SKEW};
use common::secret::{ExposeSecret, SecretString};
use signaling_protocol::{IceServer, DEFAULT_MAX_MESSAGE_BYTES};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3001";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8082";

/// Default participant TTL in seconds (6 hours).
pub const DEFAULT_PARTICIPANT_TTL_SECONDS: u64 = 21_600;

/// Default time allowed between socket upgrade and `authenticate`.
pub const DEFAULT_AUTH_TIMEOUT_SECONDS: u64 = 10;

/// Default STUN server handed to clients.
pub const DEFAULT_STUN_SERVER_URL: &str = "stun:stun.l.google.com:19302";

/// Default relay instance ID prefix.
pub const DEFAULT_RELAY_ID_PREFIX: &str = "relay";

/// Where the session registry keeps participant records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryBackend {
    /// Shared Redis registry (default). Required for more than one relay instance.
    Redis,
    /// Process-local registry for single-instance deployments.
    Memory,
}

impl RegistryBackend {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "redis" => Ok(RegistryBackend::Redis),
            "memory" => Ok(RegistryBackend::Memory),
            other => Err(ConfigError::InvalidValue(format!(
                "RELAY_REGISTRY_BACKEND must be 'redis' or 'memory', got '{other}'"
            ))),
        }
    }
}

/// Relay configuration.
#[derive(Clone)]
pub struct Config {
    /// Redis connection URL (registry, room directory, accounts, chat log).
    pub redis_url: SecretString,

    /// HS256 secret used to verify access tokens.
    pub jwt_secret: SecretString,

    /// Session registry backend.
    pub registry_backend: RegistryBackend,

    /// WebSocket listener bind address (default: "0.0.0.0:3001").
    pub bind_address: String,

    /// Health and metrics bind address (default: "0.0.0.0:8082").
    pub health_bind_address: String,

    /// Unique identifier for this relay instance.
    pub relay_id: String,

    /// Participant record TTL in seconds.
    pub participant_ttl_seconds: u64,

    /// Seconds a socket may stay unauthenticated.
    pub auth_timeout_seconds: u64,

    /// Largest accepted inbound frame.
    pub max_message_bytes: usize,

    /// Allowed `iat` clock skew, already clamped.
    pub clock_skew: Duration,

    pub stun_server_url: String,
    pub turn_server_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<SecretString>,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &"[REDACTED]")
            .field("jwt_secret", &"[REDACTED]")
            .field("registry_backend", &self.registry_backend)
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("relay_id", &self.relay_id)
            .field("participant_ttl_seconds", &self.participant_ttl_seconds)
            .field("auth_timeout_seconds", &self.auth_timeout_seconds)
            .field("max_message_bytes", &self.max_message_bytes)
            .field("clock_skew", &self.clock_skew)
            .field("stun_server_url", &self.stun_server_url)
            .field("turn_server_url", &self.turn_server_url)
            .field("turn_username", &self.turn_username)
            .field(
                "turn_credential",
                &self.turn_credential.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or invalid.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = SecretString::from(
            vars.get("REDIS_URL")
                .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?
                .clone(),
        );

        let jwt_secret = SecretString::from(
            vars.get("RELAY_JWT_SECRET")
                .ok_or_else(|| ConfigError::MissingEnvVar("RELAY_JWT_SECRET".to_string()))?
                .clone(),
        );
        if jwt_secret.expose_secret().is_empty() {
            return Err(ConfigError::InvalidValue(
                "RELAY_JWT_SECRET must not be empty".to_string(),
            ));
        }

        let registry_backend = match vars.get("RELAY_REGISTRY_BACKEND") {
            Some(value) => RegistryBackend::parse(value)?,
            None => RegistryBackend::Redis,
        };

        let bind_address = vars
            .get("RELAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("RELAY_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let participant_ttl_seconds = vars
            .get("RELAY_PARTICIPANT_TTL_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PARTICIPANT_TTL_SECONDS);
        if participant_ttl_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "RELAY_PARTICIPANT_TTL_SECONDS must be greater than zero".to_string(),
            ));
        }

        let auth_timeout_seconds = vars
            .get("RELAY_AUTH_TIMEOUT_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_AUTH_TIMEOUT_SECONDS);

        let max_message_bytes = vars
            .get("RELAY_MAX_MESSAGE_BYTES")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);

        let clock_skew = vars
            .get("RELAY_CLOCK_SKEW_SECONDS")
            .and_then(|s| s.parse().ok())
            .map_or(DEFAULT_CLOCK_SKEW, Duration::from_secs);
        let clock_skew = clamp_clock_skew(clock_skew);

        let stun_server_url = vars
            .get("STUN_SERVER_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_STUN_SERVER_URL.to_string());

        let non_empty = |key: &str| vars.get(key).filter(|v| !v.is_empty()).cloned();
        let turn_server_url = non_empty("TURN_SERVER_URL");
        let turn_username = non_empty("TURN_SERVER_USERNAME");
        let turn_credential = non_empty("TURN_SERVER_CREDENTIAL").map(SecretString::from);

        let relay_id = vars.get("RELAY_ID").cloned().unwrap_or_else(|| {
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_RELAY_ID_PREFIX}-{short_suffix}")
        });

        Ok(Config {
            redis_url,
            jwt_secret,
            registry_backend,
            bind_address,
            health_bind_address,
            relay_id,
            participant_ttl_seconds,
            auth_timeout_seconds,
            max_message_bytes,
            clock_skew,
            stun_server_url,
            turn_server_url,
            turn_username,
            turn_credential,
        })
    }

    /// Participant TTL as a `Duration`.
    #[must_use]
    pub fn participant_ttl(&self) -> Duration {
        Duration::from_secs(self.participant_ttl_seconds)
    }

    /// Authentication deadline as a `Duration`.
    #[must_use]
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_seconds)
    }

    /// ICE servers handed to clients in the `authenticated` event.
    ///
    /// The STUN entry is always present. TURN is only added when URL,
    /// username and credential are all configured.
    #[must_use]
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers = vec![IceServer {
            urls: vec![self.stun_server_url.clone()],
            username: None,
            credential: None,
        }];

        if let (Some(url), Some(username), Some(credential)) = (
            &self.turn_server_url,
            &self.turn_username,
            &self.turn_credential,
        ) {
            servers.push(IceServer {
                urls: vec![url.clone()],
                username: Some(username.clone()),
                credential: Some(credential.expose_secret().to_string()),
            });
        }

        servers
    }
}
