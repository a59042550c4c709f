//! Shared Redis connection.
//!
//! The redis-rs `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently, so every store clones it per operation instead of locking.

use crate::errors::RelayError;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tracing::error;

/// Connected Redis handle shared by the registry and the collaborator stores.
#[derive(Clone)]
pub struct RedisConnection {
    connection: MultiplexedConnection,
}

impl RedisConnection {
    /// Open a client and establish the multiplexed connection.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Redis` if the URL is invalid or the server is unreachable.
    pub async fn connect(redis_url: &str) -> Result<Self, RelayError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do not log redis_url, it may contain credentials
            error!(
                target: "relay.redis.client",
                error = %e,
                "Failed to open Redis client"
            );
            RelayError::Redis(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "relay.redis.client",
                    error = %e,
                    "Failed to connect to Redis"
                );
                RelayError::Redis(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self { connection })
    }

    /// Clone of the multiplexed connection for one operation.
    #[must_use]
    pub fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}
