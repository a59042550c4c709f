//! `PeerLink` - negotiation state for one remote participant.
//!
//! Offer/answer follows the polite-peer pattern. Both sides compare user ids
//! and agree, without talking, that the side whose id sorts lower is polite.
//! When offers collide:
//!
//! - the polite side rolls back its own offer and answers the remote one
//! - the impolite side ignores the remote offer and waits for its answer
//!
//! Remote candidates that arrive before any remote description are queued
//! and applied in arrival order once one is set.
//!
//! `PeerLink` has no task of its own. The [`LinkController`] drives it one
//! input at a time.
//!
//! [`LinkController`]: crate::controller::LinkController

use crate::error::PeerError;
use crate::media::{LocalTracks, MediaTrack};
use crate::transport::{
    IceCandidate, IceState, PeerConnection, SdpType, SenderId, SessionDescription,
    SignalingState, TrackKind,
};

use common::types::UserId;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::debug;

/// ICE restarts attempted before a link is given up.
pub const MAX_ICE_RESTARTS: u32 = 1;

/// Lifecycle of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    /// An offer was sent or received.
    Connecting,
    Connected,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Idle => "idle",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Result of applying a remote description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// The remote offer was accepted; send this answer back.
    Answer(SessionDescription),
    /// A remote answer completed our offer.
    Accepted,
    /// A colliding offer (impolite side) or a stale answer.
    Ignored,
}

/// What the controller should do after an ICE state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceAction {
    Nothing,
    /// Transient loss: start the grace timer.
    StartGrace,
    /// Connectivity is back: drop any pending grace or restart timer.
    Recovered,
    /// Restart ICE after the backoff.
    ScheduleRestart,
    /// Out of restarts.
    Fail,
}

struct Sender {
    id: SenderId,
    /// `None` once the track was detached.
    track_id: Option<String>,
}

/// Negotiation state for one remote participant.
pub struct PeerLink {
    local_id: UserId,
    remote_id: UserId,
    polite: bool,
    connection: Box<dyn PeerConnection>,
    state: LinkState,
    ice_state: IceState,
    making_offer: bool,
    ignore_offer: bool,
    has_remote_description: bool,
    pending_candidates: VecDeque<IceCandidate>,
    senders: HashMap<TrackKind, Sender>,
    ice_restarts: u32,
}

impl PeerLink {
    #[must_use]
    pub fn new(local_id: UserId, remote_id: UserId, connection: Box<dyn PeerConnection>) -> Self {
        let polite = local_id < remote_id;
        Self {
            local_id,
            remote_id,
            polite,
            connection,
            state: LinkState::Idle,
            ice_state: IceState::New,
            making_offer: false,
            ignore_offer: false,
            has_remote_description: false,
            pending_candidates: VecDeque::new(),
            senders: HashMap::new(),
            ice_restarts: 0,
        }
    }

    #[must_use]
    pub fn local_id(&self) -> &UserId {
        &self.local_id
    }

    #[must_use]
    pub fn remote_id(&self) -> &UserId {
        &self.remote_id
    }

    #[must_use]
    pub fn is_polite(&self) -> bool {
        self.polite
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        self.state
    }

    #[must_use]
    pub fn ice_state(&self) -> IceState {
        self.ice_state
    }

    #[must_use]
    pub fn ice_restarts(&self) -> u32 {
        self.ice_restarts
    }

    #[must_use]
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    #[must_use]
    pub fn signaling_state(&self) -> SignalingState {
        self.connection.signaling_state()
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.state == LinkState::Closed {
            return Err(PeerError::LinkClosed);
        }
        Ok(())
    }

    fn mark_connecting(&mut self) {
        if self.state == LinkState::Idle {
            self.state = LinkState::Connecting;
        }
    }

    /// Create and apply a local offer.
    ///
    /// Returns `None` while another negotiation is in flight; the caller
    /// sends nothing in that case.
    pub async fn make_offer(
        &mut self,
        ice_restart: bool,
    ) -> Result<Option<SessionDescription>, PeerError> {
        self.ensure_open()?;
        if self.connection.signaling_state() != SignalingState::Stable {
            debug!(
                target: "peer.link",
                remote = %self.remote_id,
                "Offer skipped, negotiation in flight"
            );
            return Ok(None);
        }

        self.making_offer = true;
        let result = async {
            let offer = self.connection.create_offer(ice_restart).await?;
            self.connection.set_local_description(offer.clone()).await?;
            Ok::<_, PeerError>(offer)
        }
        .await;
        self.making_offer = false;

        let offer = result?;
        self.mark_connecting();
        debug!(
            target: "peer.link",
            remote = %self.remote_id,
            ice_restart = ice_restart,
            "Local offer created"
        );
        Ok(Some(offer))
    }

    /// Apply a remote offer or answer.
    pub async fn handle_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<RemoteOutcome, PeerError> {
        self.ensure_open()?;
        match description.sdp_type {
            SdpType::Offer => self.handle_remote_offer(description).await,
            SdpType::Answer => self.handle_remote_answer(description).await,
        }
    }

    async fn handle_remote_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<RemoteOutcome, PeerError> {
        let collision =
            self.making_offer || self.connection.signaling_state() != SignalingState::Stable;
        self.ignore_offer = !self.polite && collision;

        if self.ignore_offer {
            debug!(
                target: "peer.link",
                remote = %self.remote_id,
                "Ignoring colliding offer"
            );
            return Ok(RemoteOutcome::Ignored);
        }

        if collision {
            debug!(
                target: "peer.link",
                remote = %self.remote_id,
                "Offer collision, rolling back local offer"
            );
            self.connection.rollback().await?;
        }

        self.connection.set_remote_description(offer).await?;
        self.has_remote_description = true;
        self.flush_candidates().await;

        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;
        self.mark_connecting();
        Ok(RemoteOutcome::Answer(answer))
    }

    async fn handle_remote_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<RemoteOutcome, PeerError> {
        if self.connection.signaling_state() != SignalingState::HaveLocalOffer {
            debug!(
                target: "peer.link",
                remote = %self.remote_id,
                "Dropping stale answer"
            );
            return Ok(RemoteOutcome::Ignored);
        }

        self.connection.set_remote_description(answer).await?;
        self.has_remote_description = true;
        self.ignore_offer = false;
        self.flush_candidates().await;
        Ok(RemoteOutcome::Accepted)
    }

    /// Apply a remote candidate, or queue it until a remote description exists.
    pub async fn handle_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        if !self.has_remote_description {
            self.pending_candidates.push_back(candidate);
            return Ok(());
        }

        match self.connection.add_ice_candidate(candidate).await {
            Ok(()) => Ok(()),
            // Candidates for an offer we ignored cannot be applied.
            Err(e) if self.ignore_offer => {
                debug!(
                    target: "peer.link",
                    remote = %self.remote_id,
                    error = %e,
                    "Dropping candidate for ignored offer"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn flush_candidates(&mut self) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = self.connection.add_ice_candidate(candidate).await {
                debug!(
                    target: "peer.link",
                    remote = %self.remote_id,
                    error = %e,
                    "Queued candidate rejected"
                );
            }
        }
    }

    /// Bring the senders in line with the local tracks.
    ///
    /// A changed track goes onto the existing sender of its kind and a removed
    /// track is detached from it. Only a new sender needs renegotiation,
    /// reported by returning `true`.
    pub async fn sync_tracks(&mut self, tracks: &LocalTracks) -> Result<bool, PeerError> {
        self.ensure_open()?;
        let mut renegotiate = false;

        for kind in [TrackKind::Audio, TrackKind::Video] {
            let track = tracks.outbound(kind);
            let wanted = track.map(MediaTrack::id);

            match (self.senders.get_mut(&kind), track) {
                (Some(sender), _) if sender.track_id.as_deref() == wanted => {}
                (Some(sender), track) => {
                    self.connection.replace_track(sender.id, track).await?;
                    sender.track_id = wanted.map(str::to_string);
                    debug!(
                        target: "peer.link",
                        remote = %self.remote_id,
                        kind = ?kind,
                        detached = track.is_none(),
                        "Replaced track on existing sender"
                    );
                }
                (None, Some(track)) => {
                    let id = self.connection.add_track(kind, track).await?;
                    self.senders.insert(
                        kind,
                        Sender {
                            id,
                            track_id: Some(track.id().to_string()),
                        },
                    );
                    renegotiate = true;
                }
                (None, None) => {}
            }
        }

        Ok(renegotiate)
    }

    /// Record an ICE state change and decide how to react.
    pub fn on_ice_state(&mut self, state: IceState) -> IceAction {
        self.ice_state = state;
        match state {
            IceState::Connected => {
                self.state = LinkState::Connected;
                self.ice_restarts = 0;
                IceAction::Recovered
            }
            IceState::Disconnected => IceAction::StartGrace,
            IceState::Failed => self.recovery_action(),
            IceState::New | IceState::Checking | IceState::Closed => IceAction::Nothing,
        }
    }

    /// Action once connectivity has been lost for longer than the grace window.
    #[must_use]
    pub fn recovery_action(&self) -> IceAction {
        if self.ice_restarts < MAX_ICE_RESTARTS {
            IceAction::ScheduleRestart
        } else {
            IceAction::Fail
        }
    }

    /// Restart ICE and produce the restart offer.
    ///
    /// An unanswered local offer still carries the failed ICE credentials, so
    /// it is rolled back first. Returns `None` when no restart offer can be
    /// made; the restart budget is only spent once one exists.
    pub async fn restart_ice(&mut self) -> Result<Option<SessionDescription>, PeerError> {
        self.ensure_open()?;
        match self.connection.signaling_state() {
            SignalingState::Stable => {}
            SignalingState::HaveLocalOffer => {
                debug!(
                    target: "peer.link",
                    remote = %self.remote_id,
                    "Rolling back unanswered offer for ICE restart"
                );
                self.connection.rollback().await?;
            }
            SignalingState::HaveRemoteOffer | SignalingState::Closed => return Ok(None),
        }

        self.connection.restart_ice().await?;
        let offer = self.make_offer(true).await?;
        if offer.is_some() {
            self.ice_restarts += 1;
        }
        Ok(offer)
    }

    pub async fn close(&mut self) {
        if self.state == LinkState::Closed {
            return;
        }
        self.state = LinkState::Closed;
        self.pending_candidates.clear();
        self.connection.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorded {
        state: Option<SignalingState>,
        offers: u32,
        calls: Vec<String>,
        candidates: Vec<String>,
        remote_set: bool,
    }

    /// Minimal peer connection that tracks signaling state and records calls.
    #[derive(Clone, Default)]
    struct RecordingConnection(Arc<Mutex<Recorded>>);

    impl RecordingConnection {
        fn calls(&self) -> Vec<String> {
            self.0.lock().unwrap().calls.clone()
        }

        fn candidates(&self) -> Vec<String> {
            self.0.lock().unwrap().candidates.clone()
        }

        fn record(&self, call: &str) {
            self.0.lock().unwrap().calls.push(call.to_string());
        }

        fn set_state(&self, state: SignalingState) {
            self.0.lock().unwrap().state = Some(state);
        }
    }

    #[async_trait]
    impl PeerConnection for RecordingConnection {
        async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
            let mut inner = self.0.lock().unwrap();
            inner.offers += 1;
            inner.calls.push(format!("create_offer({ice_restart})"));
            Ok(SessionDescription::offer(format!("offer-{}", inner.offers)))
        }

        async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
            self.record("create_answer");
            Ok(SessionDescription::answer("answer"))
        }

        async fn set_local_description(
            &self,
            description: SessionDescription,
        ) -> Result<(), PeerError> {
            self.record("set_local");
            self.set_state(match description.sdp_type {
                SdpType::Offer => SignalingState::HaveLocalOffer,
                SdpType::Answer => SignalingState::Stable,
            });
            Ok(())
        }

        async fn set_remote_description(
            &self,
            description: SessionDescription,
        ) -> Result<(), PeerError> {
            self.record("set_remote");
            self.0.lock().unwrap().remote_set = true;
            self.set_state(match description.sdp_type {
                SdpType::Offer => SignalingState::HaveRemoteOffer,
                SdpType::Answer => SignalingState::Stable,
            });
            Ok(())
        }

        async fn rollback(&self) -> Result<(), PeerError> {
            self.record("rollback");
            self.set_state(SignalingState::Stable);
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
            let mut inner = self.0.lock().unwrap();
            if !inner.remote_set {
                return Err(PeerError::Negotiation("no remote description".to_string()));
            }
            inner.candidates.push(candidate.candidate);
            Ok(())
        }

        async fn add_track(
            &self,
            kind: TrackKind,
            track: &MediaTrack,
        ) -> Result<SenderId, PeerError> {
            self.record(&format!("add_track({kind:?},{})", track.id()));
            Ok(SenderId(match kind {
                TrackKind::Audio => 1,
                TrackKind::Video => 2,
            }))
        }

        async fn replace_track(
            &self,
            sender: SenderId,
            track: Option<&MediaTrack>,
        ) -> Result<(), PeerError> {
            let id = track.map_or("none", MediaTrack::id);
            self.record(&format!("replace_track({},{id})", sender.0));
            Ok(())
        }

        async fn restart_ice(&self) -> Result<(), PeerError> {
            self.record("restart_ice");
            Ok(())
        }

        fn signaling_state(&self) -> SignalingState {
            self.0.lock().unwrap().state.unwrap_or(SignalingState::Stable)
        }

        async fn close(&self) {
            self.record("close");
        }
    }

    fn link(local: &str, remote: &str) -> (PeerLink, RecordingConnection) {
        let connection = RecordingConnection::default();
        let link = PeerLink::new(
            UserId::from(local),
            UserId::from(remote),
            Box::new(connection.clone()),
        );
        (link, connection)
    }

    fn candidate(name: &str) -> IceCandidate {
        IceCandidate {
            candidate: name.to_string(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    #[test]
    fn test_lower_id_is_polite() {
        let (a, _) = link("alice", "bob");
        let (b, _) = link("bob", "alice");
        assert!(a.is_polite());
        assert!(!b.is_polite());
    }

    #[tokio::test]
    async fn test_polite_side_rolls_back_on_collision() {
        let (mut a, conn) = link("alice", "bob");
        let offer = a.make_offer(false).await.unwrap();
        assert!(offer.is_some());
        assert_eq!(a.state(), LinkState::Connecting);

        let outcome = a
            .handle_remote_description(SessionDescription::offer("bob-offer"))
            .await
            .unwrap();

        assert_eq!(outcome, RemoteOutcome::Answer(SessionDescription::answer("answer")));
        assert!(conn.calls().contains(&"rollback".to_string()));
        assert_eq!(a.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_impolite_side_ignores_colliding_offer() {
        let (mut b, conn) = link("bob", "alice");
        b.make_offer(false).await.unwrap();

        let outcome = b
            .handle_remote_description(SessionDescription::offer("alice-offer"))
            .await
            .unwrap();

        assert_eq!(outcome, RemoteOutcome::Ignored);
        assert!(!conn.calls().contains(&"rollback".to_string()));
        assert_eq!(b.signaling_state(), SignalingState::HaveLocalOffer);

        // Our own offer still completes.
        let outcome = b
            .handle_remote_description(SessionDescription::answer("alice-answer"))
            .await
            .unwrap();
        assert_eq!(outcome, RemoteOutcome::Accepted);
        assert_eq!(b.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_offer_skipped_while_in_flight() {
        let (mut a, _) = link("alice", "bob");
        assert!(a.make_offer(false).await.unwrap().is_some());
        assert!(a.make_offer(false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let (mut a, conn) = link("alice", "bob");
        a.handle_remote_candidate(candidate("c1")).await.unwrap();
        a.handle_remote_candidate(candidate("c2")).await.unwrap();
        assert_eq!(a.pending_candidates(), 2);
        assert!(conn.candidates().is_empty());

        a.handle_remote_description(SessionDescription::offer("bob-offer"))
            .await
            .unwrap();
        assert_eq!(a.pending_candidates(), 0);

        a.handle_remote_candidate(candidate("c3")).await.unwrap();
        assert_eq!(conn.candidates(), vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn test_stale_answer_dropped() {
        let (mut a, conn) = link("alice", "bob");
        let outcome = a
            .handle_remote_description(SessionDescription::answer("late"))
            .await
            .unwrap();
        assert_eq!(outcome, RemoteOutcome::Ignored);
        assert!(!conn.calls().contains(&"set_remote".to_string()));
    }

    #[tokio::test]
    async fn test_track_changes_reuse_senders() {
        let (mut a, conn) = link("alice", "bob");
        let mut tracks = LocalTracks {
            audio: Some(MediaTrack::new("mic", TrackKind::Audio)),
            video: Some(MediaTrack::new("cam", TrackKind::Video)),
            screen: None,
        };

        assert!(a.sync_tracks(&tracks).await.unwrap());
        assert!(!a.sync_tracks(&tracks).await.unwrap());

        tracks.screen = Some(MediaTrack::new("screen", TrackKind::Video));
        assert!(!a.sync_tracks(&tracks).await.unwrap());

        let calls = conn.calls();
        assert_eq!(
            calls,
            vec![
                "add_track(Audio,mic)",
                "add_track(Video,cam)",
                "replace_track(2,screen)",
            ]
        );
    }

    #[tokio::test]
    async fn test_screen_share_without_camera_adds_sender() {
        let (mut a, _) = link("alice", "bob");
        let mut tracks = LocalTracks {
            audio: Some(MediaTrack::new("mic", TrackKind::Audio)),
            ..LocalTracks::default()
        };
        assert!(a.sync_tracks(&tracks).await.unwrap());

        tracks.screen = Some(MediaTrack::new("screen", TrackKind::Video));
        assert!(a.sync_tracks(&tracks).await.unwrap());
    }

    #[tokio::test]
    async fn test_ice_failure_allows_one_restart() {
        let (mut a, conn) = link("alice", "bob");
        assert_eq!(a.on_ice_state(IceState::Failed), IceAction::ScheduleRestart);

        let offer = a.restart_ice().await.unwrap();
        assert!(offer.is_some());
        assert!(conn.calls().contains(&"create_offer(true)".to_string()));
        assert_eq!(a.ice_restarts(), 1);

        assert_eq!(a.on_ice_state(IceState::Failed), IceAction::Fail);
    }

    #[tokio::test]
    async fn test_restart_rolls_back_unanswered_offer() {
        let (mut a, conn) = link("alice", "bob");
        a.make_offer(false).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);

        let offer = a.restart_ice().await.unwrap();

        assert!(offer.is_some());
        assert_eq!(a.ice_restarts(), 1);
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);
        assert_eq!(
            conn.calls(),
            vec![
                "create_offer(false)",
                "set_local",
                "rollback",
                "restart_ice",
                "create_offer(true)",
                "set_local",
            ]
        );
    }

    #[tokio::test]
    async fn test_restart_refused_while_answering() {
        let (mut a, conn) = link("alice", "bob");
        conn.set_state(SignalingState::HaveRemoteOffer);

        assert!(a.restart_ice().await.unwrap().is_none());
        assert_eq!(a.ice_restarts(), 0);
        assert!(conn.calls().is_empty());
    }

    #[tokio::test]
    async fn test_removed_track_is_detached_from_sender() {
        let (mut a, conn) = link("alice", "bob");
        let mut tracks = LocalTracks {
            audio: Some(MediaTrack::new("mic", TrackKind::Audio)),
            screen: Some(MediaTrack::new("screen", TrackKind::Video)),
            ..LocalTracks::default()
        };
        assert!(a.sync_tracks(&tracks).await.unwrap());

        tracks.screen = None;
        assert!(!a.sync_tracks(&tracks).await.unwrap());
        assert!(!a.sync_tracks(&tracks).await.unwrap());

        tracks.video = Some(MediaTrack::new("cam", TrackKind::Video));
        assert!(!a.sync_tracks(&tracks).await.unwrap());

        assert_eq!(
            conn.calls(),
            vec![
                "add_track(Audio,mic)",
                "add_track(Video,screen)",
                "replace_track(2,none)",
                "replace_track(2,cam)",
            ]
        );
    }

    #[tokio::test]
    async fn test_connected_resets_restart_budget() {
        let (mut a, _) = link("alice", "bob");
        a.restart_ice().await.unwrap();
        assert_eq!(a.on_ice_state(IceState::Connected), IceAction::Recovered);
        assert_eq!(a.state(), LinkState::Connected);
        assert_eq!(a.ice_restarts(), 0);
        assert_eq!(a.on_ice_state(IceState::Disconnected), IceAction::StartGrace);
        assert_eq!(a.recovery_action(), IceAction::ScheduleRestart);
    }

    #[tokio::test]
    async fn test_closed_link_rejects_work() {
        let (mut a, conn) = link("alice", "bob");
        a.close().await;
        a.close().await;
        assert_eq!(conn.calls(), vec!["close"]);
        assert!(matches!(
            a.make_offer(false).await,
            Err(PeerError::LinkClosed)
        ));
    }
}
