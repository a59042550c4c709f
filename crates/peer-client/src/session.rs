//! `RoomSession` - one room, seen from one client.
//!
//! Consumes relay client events, keeps the membership view current and
//! owns exactly one link per remote participant:
//!
//! - `request-offers` and `user-joined` start links that offer, provided
//!   there is local media to send
//! - an incoming offer from a peer without a link creates an answering link
//! - `user-left` and `kicked` tear links down
//! - a relay reconnect closes every link; the snapshot and offer requests
//!   that follow the automatic rejoin build fresh ones
//!
//! Anything the user should see is reported as a [`SessionNotice`].

use crate::controller::{
    LinkController, LinkEvent, LinkHandle, LinkParams, LinkTimings, OutboundSignal,
};
use crate::error::PeerError;
use crate::media::LocalMedia;
use crate::membership::{reduce, MembershipView};
use crate::negotiation::LinkState;
use crate::relay_client::{RelayClientEvent, RelayClientHandle};
use crate::transport::{PeerConnectionFactory, TrackKind};

use common::types::{RoomSlug, UserId};
use signaling_protocol::{ClientMessage, IceServer, RelayEnvelope, ServerEvent, SignalKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Capacity of the session's internal channels.
pub const SESSION_CHANNEL_CAPACITY: usize = 256;

/// Something the user should be told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// The relay connection dropped; reconnect attempt `attempt` is pending.
    TransientReconnect { attempt: u32 },
    /// The relay connection is back and the room is being rejoined.
    Reconnected,
    /// The relay gave up reconnecting. Rejoin manually.
    Disconnected { reason: String },
    JoinFailed { room: RoomSlug, reason: String },
    Kicked { room: RoomSlug },
    /// Media to `remote` could not be recovered. Rejoin manually.
    LinkFailed { remote: UserId, reason: String },
    LinkStateChanged { remote: UserId, state: LinkState },
    RemoteTrack {
        remote: UserId,
        kind: TrackKind,
        track_id: String,
    },
}

/// What the application watches while a `RoomSession` runs.
pub struct SessionChannels {
    pub notices: mpsc::Receiver<SessionNotice>,
    pub view: watch::Receiver<MembershipView>,
}

/// Orchestrates links and membership for one room.
pub struct RoomSession {
    room: RoomSlug,
    local_id: Option<UserId>,
    ice_servers: Vec<IceServer>,
    view: MembershipView,
    view_tx: watch::Sender<MembershipView>,
    links: HashMap<UserId, LinkHandle>,
    factory: Arc<dyn PeerConnectionFactory>,
    media: LocalMedia,
    timings: LinkTimings,
    signals: mpsc::Sender<OutboundSignal>,
    /// Signals the links want sent; `run` forwards them to the relay.
    signals_rx: mpsc::Receiver<OutboundSignal>,
    link_events: mpsc::Sender<LinkEvent>,
    link_events_rx: mpsc::Receiver<LinkEvent>,
    notices: mpsc::Sender<SessionNotice>,
    cancel_token: CancellationToken,
    links_created: u64,
}

impl RoomSession {
    pub fn new(
        room: RoomSlug,
        factory: Arc<dyn PeerConnectionFactory>,
        media: LocalMedia,
        timings: LinkTimings,
        cancel_token: CancellationToken,
    ) -> (Self, SessionChannels) {
        let (signals, signals_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let (link_events, link_events_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let (notices, notices_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let (view_tx, view_rx) = watch::channel(MembershipView::default());

        let session = Self {
            room,
            local_id: None,
            ice_servers: Vec::new(),
            view: MembershipView::default(),
            view_tx,
            links: HashMap::new(),
            factory,
            media,
            timings,
            signals,
            signals_rx,
            link_events,
            link_events_rx,
            notices,
            cancel_token,
            links_created: 0,
        };
        let channels = SessionChannels {
            notices: notices_rx,
            view: view_rx,
        };
        (session, channels)
    }

    #[must_use]
    pub fn room(&self) -> &RoomSlug {
        &self.room
    }

    #[must_use]
    pub fn view(&self) -> &MembershipView {
        &self.view
    }

    #[must_use]
    pub fn link(&self, remote: &UserId) -> Option<&LinkHandle> {
        self.links.get(remote)
    }

    /// Remote participants with a live link, sorted.
    #[must_use]
    pub fn linked_participants(&self) -> Vec<UserId> {
        let mut remotes: Vec<UserId> = self
            .links
            .iter()
            .filter(|(_, link)| !link.is_closed())
            .map(|(remote, _)| remote.clone())
            .collect();
        remotes.sort();
        remotes
    }

    /// Links created over the session's lifetime.
    #[must_use]
    pub fn links_created(&self) -> u64 {
        self.links_created
    }

    /// Drive the session until cancelled or the relay client stops.
    #[instrument(skip_all, name = "peer.session", fields(room = %self.room))]
    pub async fn run(
        mut self,
        relay: RelayClientHandle,
        mut relay_events: mpsc::Receiver<RelayClientEvent>,
    ) {
        if self.local_id.is_none() {
            self.local_id = Some(relay.user_id().clone());
            self.ice_servers = relay.ice_servers().to_vec();
        }

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,

                event = relay_events.recv() => {
                    match event {
                        Some(event) => self.handle_relay_event(event).await,
                        None => break,
                    }
                }

                Some(signal) = self.signals_rx.recv() => {
                    let message = ClientMessage::Signal {
                        room: self.room.clone(),
                        to: signal.to,
                        kind: signal.kind,
                        payload: signal.payload,
                    };
                    if let Err(e) = relay.send(message).await {
                        debug!(target: "peer.session", error = %e, "Signal not sent");
                    }
                }

                Some(event) = self.link_events_rx.recv() => {
                    self.handle_link_event(event).await;
                }
            }
        }

        self.close_all_links();
        debug!(target: "peer.session", room = %self.room, "Room session stopped");
    }

    /// Next signal a link produced. `run` consumes these itself.
    pub async fn next_signal(&mut self) -> Option<OutboundSignal> {
        self.signals_rx.recv().await
    }

    /// Next link report. `run` consumes these itself.
    pub async fn next_link_event(&mut self) -> Option<LinkEvent> {
        self.link_events_rx.recv().await
    }

    pub async fn handle_relay_event(&mut self, event: RelayClientEvent) {
        match event {
            RelayClientEvent::Authenticated {
                user_id,
                ice_servers,
            } => {
                self.local_id = Some(user_id);
                self.ice_servers = ice_servers;
            }
            RelayClientEvent::Event(event) => self.handle_server_event(event).await,
            RelayClientEvent::Reconnecting { attempt, .. } => {
                self.notify(SessionNotice::TransientReconnect { attempt })
                    .await;
            }
            RelayClientEvent::Reconnected => {
                info!(
                    target: "peer.session",
                    room = %self.room,
                    links = self.links.len(),
                    "Relay reconnected, closing links until the room snapshot arrives"
                );
                self.close_all_links();
                self.notify(SessionNotice::Reconnected).await;
            }
            RelayClientEvent::Disconnected { reason } => {
                self.close_all_links();
                self.set_view(MembershipView::default());
                self.notify(SessionNotice::Disconnected { reason }).await;
            }
        }
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        if event.room() != Some(&self.room) {
            return;
        }

        let view = reduce(std::mem::take(&mut self.view), &event);
        self.set_view(view);

        match event {
            ServerEvent::JoinResponse {
                room,
                success: false,
                error,
            } => {
                let reason = error.unwrap_or_else(|| "Join rejected".to_string());
                self.notify(SessionNotice::JoinFailed { room, reason }).await;
            }
            ServerEvent::Joined { .. } => {
                if self.local_id.is_none() {
                    self.local_id = self.view.local_id().cloned();
                }
                // Links to anybody missing from the snapshot are stale.
                let view = &self.view;
                self.links.retain(|remote, link| {
                    let keep = view.contains(remote);
                    if !keep {
                        link.close();
                    }
                    keep
                });
            }
            ServerEvent::UserJoined { participant, .. } => {
                if self.is_local(&participant.user_id) {
                    return;
                }
                // A fresh arrival is a fresh peer connection on their side.
                self.close_link(&participant.user_id);
                if self.media.has_media() {
                    self.start_link(&participant.user_id, true).await;
                }
            }
            ServerEvent::RequestOffers { participants, .. } => {
                if !self.media.has_media() {
                    debug!(
                        target: "peer.session",
                        room = %self.room,
                        "No local media, waiting for remote offers"
                    );
                    return;
                }
                for participant in participants {
                    if self.is_local(&participant.user_id) {
                        continue;
                    }
                    let Some(link) = self.live_link(&participant.user_id).cloned() else {
                        self.start_link(&participant.user_id, true).await;
                        continue;
                    };
                    if let Err(e) = link.offer().await {
                        warn!(
                            target: "peer.session",
                            remote = %participant.user_id,
                            error = %e,
                            "Link rejected offer request, replacing it"
                        );
                        self.close_link(&participant.user_id);
                        self.start_link(&participant.user_id, true).await;
                    }
                }
            }
            ServerEvent::UserLeft { user_id, .. } => self.close_link(&user_id),
            ServerEvent::Kicked { room } => {
                self.close_all_links();
                self.notify(SessionNotice::Kicked { room }).await;
            }
            ServerEvent::Signal(envelope) => self.route_signal(envelope).await,
            _ => {}
        }
    }

    async fn route_signal(&mut self, envelope: RelayEnvelope) {
        if !self.is_local(&envelope.to) {
            debug!(
                target: "peer.session",
                from = %envelope.from,
                "Dropping signal addressed to someone else"
            );
            return;
        }

        let existing = self.live_link(&envelope.from).cloned();
        let link = match existing {
            Some(link) => link,
            None if envelope.kind == SignalKind::Offer => {
                match self.start_link(&envelope.from, false).await {
                    Some(link) => link,
                    None => return,
                }
            }
            None => {
                debug!(
                    target: "peer.session",
                    from = %envelope.from,
                    kind = ?envelope.kind,
                    "Dropping signal for unknown link"
                );
                return;
            }
        };

        if let Err(e) = link.signal(envelope.kind, envelope.payload).await {
            debug!(
                target: "peer.session",
                from = %envelope.from,
                error = %e,
                "Signal not delivered to link"
            );
        }
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::StateChanged { remote, state } => {
                if state == LinkState::Closed {
                    self.forget_closed_link(&remote);
                }
                self.notify(SessionNotice::LinkStateChanged { remote, state })
                    .await;
            }
            LinkEvent::RemoteTrack {
                remote,
                kind,
                track_id,
            } => {
                self.notify(SessionNotice::RemoteTrack {
                    remote,
                    kind,
                    track_id,
                })
                .await;
            }
            LinkEvent::LinkFailed { remote, reason } => {
                self.forget_closed_link(&remote);
                self.notify(SessionNotice::LinkFailed { remote, reason })
                    .await;
            }
        }
    }

    async fn start_link(&mut self, remote: &UserId, initiate: bool) -> Option<LinkHandle> {
        let Some(local_id) = self.local_id.clone() else {
            warn!(target: "peer.session", remote = %remote, "Cannot start link before authentication");
            return None;
        };

        match self.create_link(local_id, remote, initiate).await {
            Ok(link) => Some(link),
            Err(e) => {
                warn!(
                    target: "peer.session",
                    remote = %remote,
                    error = %e,
                    "Failed to create peer connection"
                );
                self.notify(SessionNotice::LinkFailed {
                    remote: remote.clone(),
                    reason: e.to_string(),
                })
                .await;
                None
            }
        }
    }

    async fn create_link(
        &mut self,
        local_id: UserId,
        remote: &UserId,
        initiate: bool,
    ) -> Result<LinkHandle, PeerError> {
        let (connection, transport_events) = self.factory.create(remote, &self.ice_servers).await?;

        let (link, _task) = LinkController::spawn(LinkParams {
            local_id,
            remote_id: remote.clone(),
            connection,
            transport_events,
            media: self.media.subscribe(),
            outbound: self.signals.clone(),
            events: self.link_events.clone(),
            timings: self.timings,
            cancel_token: self.cancel_token.child_token(),
            initiate,
        });

        if let Some(previous) = self.links.insert(remote.clone(), link.clone()) {
            previous.close();
        }
        self.links_created += 1;
        debug!(
            target: "peer.session",
            remote = %remote,
            initiate = initiate,
            "Link created"
        );
        Ok(link)
    }

    fn live_link(&self, remote: &UserId) -> Option<&LinkHandle> {
        self.links.get(remote).filter(|link| !link.is_closed())
    }

    fn close_link(&mut self, remote: &UserId) {
        if let Some(link) = self.links.remove(remote) {
            debug!(target: "peer.session", remote = %remote, "Closing link");
            link.close();
        }
    }

    fn forget_closed_link(&mut self, remote: &UserId) {
        if self.links.get(remote).is_some_and(LinkHandle::is_closed) {
            self.links.remove(remote);
        }
    }

    /// Close every link immediately.
    pub fn close_all_links(&mut self) {
        for (_, link) in self.links.drain() {
            link.close();
        }
    }

    fn is_local(&self, user_id: &UserId) -> bool {
        self.local_id.as_ref() == Some(user_id)
    }

    fn set_view(&mut self, view: MembershipView) {
        self.view = view;
        self.view_tx.send_replace(self.view.clone());
    }

    async fn notify(&self, notice: SessionNotice) {
        if self.notices.send(notice).await.is_err() {
            debug!(target: "peer.session", "Notice receiver dropped");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::{LocalTracks, MediaTrack};
    use crate::transport::{PeerConnection, TransportEvent};
    use async_trait::async_trait;
    use signaling_protocol::ParticipantSnapshot;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts connection attempts and refuses every one.
    #[derive(Default)]
    struct RefusingFactory {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl PeerConnectionFactory for RefusingFactory {
        async fn create(
            &self,
            _remote: &UserId,
            _ice_servers: &[IceServer],
        ) -> Result<(Box<dyn PeerConnection>, mpsc::Receiver<TransportEvent>), PeerError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(PeerError::Transport("no peer connections in this test".to_string()))
        }
    }

    fn snapshot(user: &str) -> ParticipantSnapshot {
        ParticipantSnapshot {
            user_id: UserId::from(user),
            display_name: user.to_string(),
            avatar_url: None,
            muted: false,
            camera_off: false,
            screen_sharing: false,
            is_host: false,
        }
    }

    #[tokio::test]
    async fn test_offer_request_replaces_link_whose_task_is_gone() {
        let factory = Arc::new(RefusingFactory::default());
        let media = LocalMedia::with_tracks(LocalTracks {
            audio: Some(MediaTrack::new("mic", TrackKind::Audio)),
            ..LocalTracks::default()
        });
        let (mut session, mut channels) = RoomSession::new(
            RoomSlug::from("standup"),
            Arc::clone(&factory) as Arc<dyn PeerConnectionFactory>,
            media,
            LinkTimings::default(),
            CancellationToken::new(),
        );
        session
            .handle_relay_event(RelayClientEvent::Authenticated {
                user_id: UserId::from("alice"),
                ice_servers: Vec::new(),
            })
            .await;

        let bob = UserId::from("bob");
        let dead = LinkHandle::detached(bob.clone());
        assert!(!dead.is_closed());
        session.links.insert(bob.clone(), dead.clone());

        session
            .handle_relay_event(RelayClientEvent::Event(ServerEvent::RequestOffers {
                room: RoomSlug::from("standup"),
                participants: vec![snapshot("bob")],
            }))
            .await;

        assert!(dead.is_closed());
        assert_eq!(factory.attempts.load(Ordering::SeqCst), 1);
        assert!(session.link(&bob).is_none());
        assert!(matches!(
            channels.notices.try_recv().unwrap(),
            SessionNotice::LinkFailed { remote, .. } if remote == bob
        ));
    }
}
