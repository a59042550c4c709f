//! Room Signaling Relay
//!
//! Authenticated WebSocket relay for room membership and WebRTC negotiation.
//!
//! # Servers
//!
//! - WebSocket endpoint for clients at `/ws` (default: 0.0.0.0:3001)
//! - HTTP server for health and metrics (default: 0.0.0.0:8082)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect to Redis
//! 4. Build the session registry (Redis or in-memory)
//! 5. Initialize actor system (`RelayControllerHandle`)
//! 6. Start health HTTP server (liveness, readiness, metrics)
//! 7. Start the WebSocket listener and mark ready
//! 8. Wait for shutdown signal, then drain rooms

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::secret::ExposeSecret;
use relay_service::actors::{ActorMetrics, RelayControllerHandle, RoomServices};
use relay_service::auth::{AccountStore, CredentialValidator, JwtCredentialValidator};
use relay_service::chat::PersistentChatLog;
use relay_service::config::{Config, RegistryBackend};
use relay_service::directory::RoomDirectory;
use relay_service::observability::{
    health_router, init_metrics_recorder, metrics_router, HealthState,
};
use relay_service::redis::{
    RedisAccountStore, RedisChatLog, RedisConnection, RedisRoomDirectory, RedisSessionRegistry,
};
use relay_service::registry::{InMemoryRegistry, SessionRegistry};
use relay_service::session::RelayContext;
use relay_service::ws::relay_router;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time allowed for rooms to close their members on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// In-memory registry sweep interval.
const REGISTRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Room Signaling Relay");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        relay_id = %config.relay_id,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        registry_backend = ?config.registry_backend,
        participant_ttl_seconds = config.participant_ttl_seconds,
        auth_timeout_seconds = config.auth_timeout_seconds,
        max_message_bytes = config.max_message_bytes,
        "Configuration loaded successfully"
    );

    // This must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new());

    info!("Connecting to Redis...");
    let redis = RedisConnection::connect(config.redis_url.expose_secret())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect to Redis");
            e
        })?;
    info!("Redis connection established");

    // Background tasks that do not belong to the actor tree
    let background_token = CancellationToken::new();

    let registry: Arc<dyn SessionRegistry> = match config.registry_backend {
        RegistryBackend::Redis => Arc::new(RedisSessionRegistry::new(
            redis.clone(),
            config.participant_ttl(),
        )),
        RegistryBackend::Memory => {
            warn!("Using in-memory session registry; run a single relay instance only");
            let memory = Arc::new(InMemoryRegistry::new(config.participant_ttl()));
            Arc::clone(&memory)
                .spawn_sweeper(REGISTRY_SWEEP_INTERVAL, background_token.child_token());
            memory
        }
    };

    let accounts: Arc<dyn AccountStore> = Arc::new(RedisAccountStore::new(redis.clone()));
    let validator: Arc<dyn CredentialValidator> = Arc::new(JwtCredentialValidator::new(
        &config.jwt_secret,
        config.clock_skew,
        accounts,
    ));
    let directory: Arc<dyn RoomDirectory> = Arc::new(RedisRoomDirectory::new(redis.clone()));
    let chat_log: Arc<dyn PersistentChatLog> = Arc::new(RedisChatLog::new(redis));

    info!("Initializing actor system...");
    let actor_metrics = ActorMetrics::new();
    let controller = RelayControllerHandle::new(
        config.relay_id.clone(),
        RoomServices {
            registry: Arc::clone(&registry),
            directory: Arc::clone(&directory),
            chat_log,
            participant_ttl: config.participant_ttl(),
        },
        Arc::clone(&actor_metrics),
    );
    info!("Actor system initialized");

    // Servers stop when the controller's token is cancelled on shutdown
    let shutdown_token = controller.child_token();

    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router(prometheus_handle));

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    let context = Arc::new(RelayContext {
        controller: controller.clone(),
        validator,
        directory,
        registry,
        metrics: actor_metrics,
        ice_servers: config.ice_servers(),
        max_message_bytes: config.max_message_bytes,
        auth_timeout: config.auth_timeout(),
    });

    let relay_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;

    let relay_listener = tokio::net::TcpListener::bind(relay_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %relay_addr, "Failed to bind WebSocket listener");
            format!("Failed to bind WebSocket listener to {relay_addr}: {e}")
        })?;

    let relay_shutdown_token = shutdown_token.child_token();
    let relay_server = tokio::spawn(async move {
        info!(addr = %relay_addr, "WebSocket server starting");
        let server = axum::serve(relay_listener, relay_router(context)).with_graceful_shutdown(
            async move {
                relay_shutdown_token.cancelled().await;
                info!("WebSocket server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "WebSocket server failed");
        }
    });

    health_state.set_ready();
    info!("Relay running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so the load balancer stops sending traffic
    health_state.set_not_ready();

    // Rooms close their members with a going-away frame, then every token is cancelled
    if let Err(e) = controller.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "Actor system shutdown error");
    }

    if tokio::time::timeout(Duration::from_secs(5), relay_server)
        .await
        .is_err()
    {
        warn!("WebSocket server did not stop in time");
    }

    background_token.cancel();

    info!("Relay shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
