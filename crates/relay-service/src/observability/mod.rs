//! Observability for the relay.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with an explicit
//! allow-list of safe fields (room slug, user ID, connection ID). Tokens,
//! passwords and signaling payloads are never logged or used as labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `relay_connections_active` | Gauge | none | Open WebSocket connections |
//! | `relay_rooms_active` | Gauge | none | Live room actors |
//! | `relay_messages_total` | Counter | `message_type` | Handled client messages |
//! | `relay_message_latency_seconds` | Histogram | `message_type` | Client message handling time |
//! | `relay_messages_dropped_total` | Counter | `reason` | Outbound events dropped for slow or closed sockets |
//! | `relay_registry_latency_seconds` | Histogram | `operation` | Session registry latency |
//! | `relay_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator |
//! | `relay_actor_panics_total` | Counter | `actor_type` | Panicked actor tasks |
//! | `relay_errors_total` | Counter | `operation`, `error_type`, `status_code` | Errors reported to clients |
//! | `relay_auth_total` | Counter | `result` | Authentication attempts |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::{init_metrics_recorder, metrics_router};
