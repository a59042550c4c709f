//! Actor metrics and mailbox monitoring.
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Room       | < 100  | 100-500 | > 500    |
//! | Connection | < 32   | 32-128  | > 128    |
//!
//! Connection mailboxes are bounded at [`CONNECTION_MAILBOX_CAPACITY`];
//! anything beyond that is dropped for the slow socket only.

use crate::observability::metrics as prom;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mailbox depth thresholds for room actors.
pub const ROOM_MAILBOX_NORMAL: usize = 100;
pub const ROOM_MAILBOX_WARNING: usize = 500;

/// Mailbox depth thresholds for connection actors.
pub const CONNECTION_MAILBOX_NORMAL: usize = 32;
pub const CONNECTION_MAILBOX_WARNING: usize = 128;

/// Channel capacity of a connection actor's mailbox.
pub const CONNECTION_MAILBOX_CAPACITY: usize = 256;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `RelayControllerActor` (singleton).
    Controller,
    /// `RoomActor` (one per live room).
    Room,
    /// `ConnectionActor` (one per WebSocket).
    Connection,
}

impl ActorType {
    /// Returns the actor type as a string for metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Controller => "controller",
            ActorType::Room => "room",
            ActorType::Connection => "connection",
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Controller | ActorType::Room => ROOM_MAILBOX_WARNING,
            ActorType::Connection => CONNECTION_MAILBOX_WARNING,
        }
    }

    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Controller | ActorType::Room => ROOM_MAILBOX_NORMAL,
            ActorType::Connection => CONNECTION_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Tracks queue depth of one actor and mirrors it to Prometheus.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Room slug or connection ID.
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
    messages_dropped: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Record a message being taken off the mailbox.
    ///
    /// `new_depth` counts the taken message plus everything still queued behind
    /// it, i.e. `receiver.len() + 1` right after `recv()`.
    pub fn record_received(&self, new_depth: usize) {
        self.depth.store(new_depth, Ordering::Relaxed);

        let mut current_peak = self.peak_depth.load(Ordering::Relaxed);
        while new_depth > current_peak {
            match self.peak_depth.compare_exchange_weak(
                current_peak,
                new_depth,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current_peak = actual,
            }
        }

        prom::set_actor_mailbox_depth(self.actor_type.as_str(), new_depth);

        let level = self.level_for_depth(new_depth);
        if level == MailboxLevel::Critical {
            warn!(
                target: "relay.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = new_depth,
                threshold = self.actor_type.warning_threshold(),
                "Mailbox depth critical"
            );
        } else if level == MailboxLevel::Warning
            && new_depth == self.actor_type.normal_threshold() + 1
        {
            debug!(
                target: "relay.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = new_depth,
                "Mailbox depth elevated"
            );
        }
    }

    /// Record a message having been processed.
    pub fn record_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message dropped because the mailbox was full.
    pub fn record_drop(&self) {
        let dropped = self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_message_dropped("mailbox_full");
        warn!(
            target: "relay.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            actor_id = %self.actor_id,
            dropped = dropped,
            "Message dropped due to backpressure"
        );
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Aggregated counters for the actor system, shared by every actor.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    pub active_rooms: AtomicUsize,
    pub active_connections: AtomicUsize,
    /// Total actor panics (indicates bugs).
    pub actor_panics: AtomicU64,
    pub total_messages_processed: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        let count = self.active_rooms.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_rooms_active(count as u64);
    }

    pub fn room_removed(&self) {
        let count = self.active_rooms.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        prom::set_rooms_active(count as u64);
    }

    pub fn connection_created(&self) {
        let count = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_connections_active(count as u64);
    }

    pub fn connection_closed(&self) {
        let count = self
            .active_connections
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        prom::set_connections_active(count as u64);
    }

    /// Record an actor panic.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "relay.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.active_rooms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}
