//! `LinkController` - one task per remote participant.
//!
//! The task owns a [`PeerLink`] and is its only driver. It selects over:
//!
//! - its mailbox (remote signals routed by the room session)
//! - the peer connection's [`TransportEvent`]s
//! - the shared local media watch
//! - the ICE grace and restart timers
//!
//! Timers are `select!` arms of the same loop, so once the link is
//! cancelled nothing can fire for it. Cancelling the handle closes the
//! peer connection before the task exits.

use crate::error::PeerError;
use crate::media::LocalTracks;
use crate::negotiation::{IceAction, LinkState, PeerLink, RemoteOutcome};
use crate::transport::{
    IceCandidate, IceState, PeerConnection, SdpType, SessionDescription, SignalingState,
    TrackKind, TransportEvent,
};

use common::types::UserId;
use signaling_protocol::SignalKind;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Link mailbox capacity.
pub const LINK_MAILBOX_CAPACITY: usize = 64;

/// ICE recovery timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimings {
    /// How long ICE may stay disconnected before a restart is attempted.
    pub ice_disconnect_grace: Duration,
    /// Delay between ICE failure and the restart offer.
    pub ice_restart_backoff: Duration,
}

impl Default for LinkTimings {
    fn default() -> Self {
        Self {
            ice_disconnect_grace: Duration::from_secs(5),
            ice_restart_backoff: Duration::from_millis(1000),
        }
    }
}

/// A signal a link wants delivered to its remote peer through the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSignal {
    pub to: UserId,
    pub kind: SignalKind,
    pub payload: serde_json::Value,
}

/// Reports from a link to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    StateChanged {
        remote: UserId,
        state: LinkState,
    },
    RemoteTrack {
        remote: UserId,
        kind: TrackKind,
        track_id: String,
    },
    /// ICE could not be recovered. The link has closed itself.
    LinkFailed {
        remote: UserId,
        reason: String,
    },
}

/// Point-in-time view of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: LinkState,
    pub ice_state: IceState,
    pub signaling_state: SignalingState,
    pub polite: bool,
    pub ice_restarts: u32,
}

#[derive(Debug)]
enum LinkMessage {
    Signal {
        kind: SignalKind,
        payload: serde_json::Value,
    },
    /// Start a negotiation from this side.
    Offer,
    GetStatus {
        respond_to: oneshot::Sender<LinkStatus>,
    },
}

/// Handle to a `LinkController`.
#[derive(Clone, Debug)]
pub struct LinkHandle {
    sender: mpsc::Sender<LinkMessage>,
    cancel_token: CancellationToken,
    remote: UserId,
}

impl LinkHandle {
    /// A handle whose controller task is already gone.
    #[cfg(test)]
    pub(crate) fn detached(remote: UserId) -> Self {
        let (sender, _receiver) = mpsc::channel(1);
        Self {
            sender,
            cancel_token: CancellationToken::new(),
            remote,
        }
    }

    #[must_use]
    pub fn remote(&self) -> &UserId {
        &self.remote
    }

    /// Route a signal from the remote peer to this link.
    pub async fn signal(
        &self,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<(), PeerError> {
        self.send(LinkMessage::Signal { kind, payload }).await
    }

    /// Ask the link to send an offer.
    pub async fn offer(&self) -> Result<(), PeerError> {
        self.send(LinkMessage::Offer).await
    }

    pub async fn status(&self) -> Result<LinkStatus, PeerError> {
        let (tx, rx) = oneshot::channel();
        self.send(LinkMessage::GetStatus { respond_to: tx }).await?;
        rx.await
            .map_err(|e| PeerError::Internal(format!("response receive failed: {e}")))
    }

    async fn send(&self, message: LinkMessage) -> Result<(), PeerError> {
        if self.cancel_token.is_cancelled() {
            return Err(PeerError::LinkClosed);
        }
        self.sender
            .send(message)
            .await
            .map_err(|_| PeerError::LinkClosed)
    }

    /// Close the link. Takes effect immediately; the task closes the peer
    /// connection on its way out.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled() || self.sender.is_closed()
    }
}

/// Everything a link task needs.
pub struct LinkParams {
    pub local_id: UserId,
    pub remote_id: UserId,
    pub connection: Box<dyn PeerConnection>,
    pub transport_events: mpsc::Receiver<TransportEvent>,
    pub media: watch::Receiver<LocalTracks>,
    pub outbound: mpsc::Sender<OutboundSignal>,
    pub events: mpsc::Sender<LinkEvent>,
    pub timings: LinkTimings,
    pub cancel_token: CancellationToken,
    /// Send an offer as soon as the local tracks are attached.
    pub initiate: bool,
}

/// The `LinkController` implementation.
pub struct LinkController {
    link: PeerLink,
    receiver: mpsc::Receiver<LinkMessage>,
    transport_events: mpsc::Receiver<TransportEvent>,
    transport_open: bool,
    media: watch::Receiver<LocalTracks>,
    media_open: bool,
    outbound: mpsc::Sender<OutboundSignal>,
    events: mpsc::Sender<LinkEvent>,
    timings: LinkTimings,
    cancel_token: CancellationToken,
    initiate: bool,
    grace_deadline: Option<Instant>,
    restart_deadline: Option<Instant>,
    reported_state: LinkState,
    failed: bool,
}

impl LinkController {
    /// Spawn a link task.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(params: LinkParams) -> (LinkHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(LINK_MAILBOX_CAPACITY);
        let handle = LinkHandle {
            sender,
            cancel_token: params.cancel_token.clone(),
            remote: params.remote_id.clone(),
        };

        let controller = Self {
            link: PeerLink::new(params.local_id, params.remote_id, params.connection),
            receiver,
            transport_events: params.transport_events,
            transport_open: true,
            media: params.media,
            media_open: true,
            outbound: params.outbound,
            events: params.events,
            timings: params.timings,
            cancel_token: params.cancel_token,
            initiate: params.initiate,
            grace_deadline: None,
            restart_deadline: None,
            reported_state: LinkState::Idle,
            failed: false,
        };

        let task = tokio::spawn(controller.run());
        (handle, task)
    }

    #[instrument(skip_all, name = "peer.link", fields(remote = %self.link.remote_id()))]
    async fn run(mut self) {
        debug!(
            target: "peer.link",
            remote = %self.link.remote_id(),
            polite = self.link.is_polite(),
            initiate = self.initiate,
            "Link started"
        );

        let tracks = self.media.borrow_and_update().clone();
        if let Err(e) = self.link.sync_tracks(&tracks).await {
            warn!(target: "peer.link", remote = %self.link.remote_id(), error = %e, "Failed to attach local tracks");
        }
        if self.initiate {
            self.offer().await;
        }

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    debug!(target: "peer.link", remote = %self.link.remote_id(), "Link cancelled");
                    break;
                }

                message = self.receiver.recv() => {
                    match message {
                        Some(message) => self.handle_message(message).await,
                        None => break,
                    }
                }

                event = self.transport_events.recv(), if self.transport_open => {
                    match event {
                        Some(event) => self.handle_transport_event(event).await,
                        None => self.transport_open = false,
                    }
                }

                changed = self.media.changed(), if self.media_open => {
                    match changed {
                        Ok(()) => self.handle_media_change().await,
                        Err(_) => self.media_open = false,
                    }
                }

                () = sleep_until(self.grace_deadline) => {
                    self.grace_deadline = None;
                    debug!(target: "peer.link", remote = %self.link.remote_id(), "ICE grace window expired");
                    let action = self.link.recovery_action();
                    self.apply_recovery(action, true).await;
                }

                () = sleep_until(self.restart_deadline) => {
                    self.restart_deadline = None;
                    self.restart().await;
                }
            }

            if self.failed {
                break;
            }
        }

        self.link.close().await;
        self.cancel_token.cancel();
        self.report_state().await;
        debug!(target: "peer.link", remote = %self.link.remote_id(), "Link stopped");
    }

    async fn handle_message(&mut self, message: LinkMessage) {
        match message {
            LinkMessage::Signal { kind, payload } => self.handle_signal(kind, payload).await,
            LinkMessage::Offer => self.offer().await,
            LinkMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(LinkStatus {
                    state: self.link.state(),
                    ice_state: self.link.ice_state(),
                    signaling_state: self.link.signaling_state(),
                    polite: self.link.is_polite(),
                    ice_restarts: self.link.ice_restarts(),
                });
            }
        }
    }

    async fn handle_signal(&mut self, kind: SignalKind, payload: serde_json::Value) {
        let result = match kind {
            SignalKind::Offer | SignalKind::Answer => {
                match serde_json::from_value::<SessionDescription>(payload) {
                    Ok(description) => self.handle_description(kind, description).await,
                    Err(e) => Err(PeerError::Negotiation(format!("invalid description: {e}"))),
                }
            }
            SignalKind::IceCandidate => match serde_json::from_value::<IceCandidate>(payload) {
                Ok(candidate) => self.link.handle_remote_candidate(candidate).await,
                Err(e) => Err(PeerError::Negotiation(format!("invalid candidate: {e}"))),
            },
        };

        if let Err(e) = result {
            warn!(
                target: "peer.link",
                remote = %self.link.remote_id(),
                kind = ?kind,
                error = %e,
                "Remote signal not applied"
            );
        }
        self.report_state().await;
    }

    async fn handle_description(
        &mut self,
        kind: SignalKind,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let expected = match kind {
            SignalKind::Offer => SdpType::Offer,
            _ => SdpType::Answer,
        };
        if description.sdp_type != expected {
            return Err(PeerError::Negotiation(format!(
                "{kind:?} signal carried a {:?} description",
                description.sdp_type
            )));
        }

        if let RemoteOutcome::Answer(answer) =
            self.link.handle_remote_description(description).await?
        {
            self.send_description(SignalKind::Answer, &answer).await;
        }
        Ok(())
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                match serde_json::to_value(&candidate) {
                    Ok(payload) => self.send_signal(SignalKind::IceCandidate, payload).await,
                    Err(e) => warn!(target: "peer.link", error = %e, "Failed to encode candidate"),
                }
            }
            TransportEvent::IceStateChanged(state) => {
                debug!(
                    target: "peer.link",
                    remote = %self.link.remote_id(),
                    ice_state = %state,
                    "ICE state changed"
                );
                let action = self.link.on_ice_state(state);
                self.apply_recovery(action, false).await;
                self.report_state().await;
            }
            TransportEvent::NegotiationNeeded => self.offer().await,
            TransportEvent::RemoteTrack { kind, track_id } => {
                let event = LinkEvent::RemoteTrack {
                    remote: self.link.remote_id().clone(),
                    kind,
                    track_id,
                };
                self.emit(event).await;
            }
        }
    }

    async fn handle_media_change(&mut self) {
        let tracks = self.media.borrow_and_update().clone();
        match self.link.sync_tracks(&tracks).await {
            Ok(true) => self.offer().await,
            Ok(false) => {}
            Err(e) => warn!(
                target: "peer.link",
                remote = %self.link.remote_id(),
                error = %e,
                "Failed to sync local tracks"
            ),
        }
    }

    /// `immediate` is set when the grace window already elapsed, so the
    /// restart does not wait for the backoff too.
    async fn apply_recovery(&mut self, action: IceAction, immediate: bool) {
        match action {
            IceAction::Nothing => {}
            IceAction::StartGrace => {
                if self.grace_deadline.is_none() {
                    self.grace_deadline = Some(Instant::now() + self.timings.ice_disconnect_grace);
                }
            }
            IceAction::Recovered => {
                self.grace_deadline = None;
                self.restart_deadline = None;
            }
            IceAction::ScheduleRestart => {
                self.grace_deadline = None;
                if immediate {
                    self.restart().await;
                } else if self.restart_deadline.is_none() {
                    self.restart_deadline = Some(Instant::now() + self.timings.ice_restart_backoff);
                }
            }
            IceAction::Fail => self.fail("ICE connectivity lost after restart").await,
        }
    }

    async fn restart(&mut self) {
        info!(
            target: "peer.link",
            remote = %self.link.remote_id(),
            attempt = self.link.ice_restarts() + 1,
            "Restarting ICE"
        );
        match self.link.restart_ice().await {
            Ok(Some(offer)) => self.send_description(SignalKind::Offer, &offer).await,
            Ok(None) => self.fail("ICE restart not possible mid-negotiation").await,
            Err(e) => self.fail(&format!("ICE restart failed: {e}")).await,
        }
    }

    async fn offer(&mut self) {
        match self.link.make_offer(false).await {
            Ok(Some(offer)) => {
                self.send_description(SignalKind::Offer, &offer).await;
                self.report_state().await;
            }
            Ok(None) => {}
            Err(e) => warn!(
                target: "peer.link",
                remote = %self.link.remote_id(),
                error = %e,
                "Failed to create offer"
            ),
        }
    }

    async fn fail(&mut self, reason: &str) {
        warn!(
            target: "peer.link",
            remote = %self.link.remote_id(),
            reason = reason,
            "Link failed"
        );
        self.failed = true;
        let event = LinkEvent::LinkFailed {
            remote: self.link.remote_id().clone(),
            reason: reason.to_string(),
        };
        self.emit(event).await;
    }

    async fn send_description(&self, kind: SignalKind, description: &SessionDescription) {
        match serde_json::to_value(description) {
            Ok(payload) => self.send_signal(kind, payload).await,
            Err(e) => warn!(target: "peer.link", error = %e, "Failed to encode description"),
        }
    }

    async fn send_signal(&self, kind: SignalKind, payload: serde_json::Value) {
        let signal = OutboundSignal {
            to: self.link.remote_id().clone(),
            kind,
            payload,
        };
        if self.outbound.send(signal).await.is_err() {
            debug!(
                target: "peer.link",
                remote = %self.link.remote_id(),
                "Outbound signal channel closed"
            );
        }
    }

    async fn report_state(&mut self) {
        let state = self.link.state();
        if state == self.reported_state {
            return;
        }
        self.reported_state = state;
        let event = LinkEvent::StateChanged {
            remote: self.link.remote_id().clone(),
            state,
        };
        self.emit(event).await;
    }

    async fn emit(&self, event: LinkEvent) {
        if self.events.send(event).await.is_err() {
            debug!(
                target: "peer.link",
                remote = %self.link.remote_id(),
                "Link event receiver dropped"
            );
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
