//! Scripted in-memory peer connections.
//!
//! `MockPeerConnection` tracks signaling state the way a browser does
//! (glare needs a rollback, answers need a local offer, candidates need a
//! remote description) and counts every call so tests can assert on
//! negotiation work. Descriptions are plain text listing the sender tracks,
//! so a remote track event fires when the other side's description lands.
//!
//! With auto-connect on (the default) ICE reports `checking` then
//! `connected` as soon as an offer/answer round completes.

use async_trait::async_trait;
use common::types::UserId;
use peer_client::media::MediaTrack;
use peer_client::transport::{
    IceCandidate, IceState, PeerConnection, PeerConnectionFactory, SdpType, SenderId,
    SessionDescription, SignalingState, TrackKind, TransportEvent,
};
use peer_client::PeerError;
use signaling_protocol::IceServer;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Transport event channel capacity per mock connection.
pub const MOCK_EVENT_CAPACITY: usize = 64;

#[derive(Debug)]
struct MockPeerState {
    remote: UserId,
    signaling: SignalingState,
    ice: IceState,
    auto_connect: bool,
    has_remote_description: bool,
    offers_created: u32,
    restart_offers: u32,
    answers_created: u32,
    rollbacks: u32,
    ice_restarts: u32,
    remote_descriptions: u32,
    candidates: Vec<IceCandidate>,
    /// Track is `None` once detached.
    senders: Vec<(SenderId, TrackKind, Option<MediaTrack>)>,
    announced_tracks: HashSet<String>,
    local_candidates_sent: u32,
    closed: bool,
}

impl MockPeerState {
    fn describe(&self, sdp_type: &str) -> String {
        let tracks: Vec<String> = self
            .senders
            .iter()
            .filter_map(|(_, kind, track)| {
                track
                    .as_ref()
                    .map(|track| format!("{}:{}", kind_name(*kind), track.id()))
            })
            .collect();
        format!(
            "mock {sdp_type} n={} tracks={}",
            self.offers_created + self.answers_created,
            tracks.join(",")
        )
    }
}

fn kind_name(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Video => "video",
    }
}

fn parse_tracks(sdp: &str) -> Vec<(TrackKind, String)> {
    let Some(list) = sdp.split("tracks=").nth(1) else {
        return Vec::new();
    };
    list.split(',')
        .filter_map(|entry| {
            let (kind, id) = entry.split_once(':')?;
            let kind = match kind {
                "audio" => TrackKind::Audio,
                "video" => TrackKind::Video,
                _ => return None,
            };
            Some((kind, id.to_string()))
        })
        .collect()
}

/// Test-side view of one mock connection.
#[derive(Clone)]
pub struct MockPeerHandle {
    state: Arc<Mutex<MockPeerState>>,
    events: mpsc::Sender<TransportEvent>,
}

impl MockPeerHandle {
    pub fn remote(&self) -> UserId {
        self.state.lock().unwrap().remote.clone()
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.state.lock().unwrap().signaling
    }

    pub fn ice_state(&self) -> IceState {
        self.state.lock().unwrap().ice
    }

    pub fn offers_created(&self) -> u32 {
        self.state.lock().unwrap().offers_created
    }

    /// Offers created with the ICE restart flag.
    pub fn restart_offers(&self) -> u32 {
        self.state.lock().unwrap().restart_offers
    }

    pub fn answers_created(&self) -> u32 {
        self.state.lock().unwrap().answers_created
    }

    pub fn rollbacks(&self) -> u32 {
        self.state.lock().unwrap().rollbacks
    }

    pub fn ice_restarts(&self) -> u32 {
        self.state.lock().unwrap().ice_restarts
    }

    pub fn remote_descriptions(&self) -> u32 {
        self.state.lock().unwrap().remote_descriptions
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().unwrap().candidates.clone()
    }

    /// `(kind, track id, enabled)` for every sender with a track attached.
    pub fn senders(&self) -> Vec<(TrackKind, String, bool)> {
        self.state
            .lock()
            .unwrap()
            .senders
            .iter()
            .filter_map(|(_, kind, track)| {
                track
                    .as_ref()
                    .map(|track| (*kind, track.id().to_string(), track.is_enabled()))
            })
            .collect()
    }

    /// Senders ever added, attached or not.
    pub fn sender_count(&self) -> usize {
        self.state.lock().unwrap().senders.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Inject a transport event as if the WebRTC stack raised it.
    pub async fn emit(&self, event: TransportEvent) {
        if let TransportEvent::IceStateChanged(ice) = &event {
            self.state.lock().unwrap().ice = *ice;
        }
        let _ = self.events.send(event).await;
    }

    pub async fn set_ice_state(&self, ice: IceState) {
        self.emit(TransportEvent::IceStateChanged(ice)).await;
    }
}

/// In-memory `PeerConnection`.
pub struct MockPeerConnection {
    state: Arc<Mutex<MockPeerState>>,
    events: mpsc::Sender<TransportEvent>,
}

impl MockPeerConnection {
    pub fn new(
        remote: UserId,
        auto_connect: bool,
    ) -> (Self, MockPeerHandle, mpsc::Receiver<TransportEvent>) {
        let (events, events_rx) = mpsc::channel(MOCK_EVENT_CAPACITY);
        let state = Arc::new(Mutex::new(MockPeerState {
            remote,
            signaling: SignalingState::Stable,
            ice: IceState::New,
            auto_connect,
            has_remote_description: false,
            offers_created: 0,
            restart_offers: 0,
            answers_created: 0,
            rollbacks: 0,
            ice_restarts: 0,
            remote_descriptions: 0,
            candidates: Vec::new(),
            senders: Vec::new(),
            announced_tracks: HashSet::new(),
            local_candidates_sent: 0,
            closed: false,
        }));
        let handle = MockPeerHandle {
            state: Arc::clone(&state),
            events: events.clone(),
        };
        (Self { state, events }, handle, events_rx)
    }

    fn check_open(state: &MockPeerState) -> Result<(), PeerError> {
        if state.closed {
            return Err(PeerError::Transport("connection closed".to_string()));
        }
        Ok(())
    }

    /// Emit without awaiting; the channel is sized for any test script.
    fn push(&self, event: TransportEvent) {
        let _ = self.events.try_send(event);
    }

    fn negotiation_completed(&self, state: &mut MockPeerState) {
        if state.auto_connect && state.ice != IceState::Connected {
            state.ice = IceState::Connected;
            self.push(TransportEvent::IceStateChanged(IceState::Checking));
            self.push(TransportEvent::IceStateChanged(IceState::Connected));
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        state.offers_created += 1;
        if ice_restart {
            state.restart_offers += 1;
        }
        Ok(SessionDescription::offer(state.describe("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(PeerError::Negotiation("no remote offer to answer".to_string()));
        }
        state.answers_created += 1;
        Ok(SessionDescription::answer(state.describe("answer")))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        match description.sdp_type {
            SdpType::Offer => {
                if state.signaling != SignalingState::Stable {
                    return Err(PeerError::Negotiation("offer outside stable".to_string()));
                }
                state.signaling = SignalingState::HaveLocalOffer;
            }
            SdpType::Answer => {
                if state.signaling != SignalingState::HaveRemoteOffer {
                    return Err(PeerError::Negotiation("answer without remote offer".to_string()));
                }
                state.signaling = SignalingState::Stable;
                self.negotiation_completed(&mut state);
            }
        }

        if state.local_candidates_sent == 0 {
            state.local_candidates_sent += 1;
            self.push(TransportEvent::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:mock 1 udp 1 127.0.0.1 {} typ host",
                    40000 + state.offers_created + state.answers_created
                ),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }));
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        match description.sdp_type {
            SdpType::Offer => {
                if state.signaling != SignalingState::Stable {
                    return Err(PeerError::Negotiation(
                        "remote offer in have-local-offer needs rollback".to_string(),
                    ));
                }
                state.signaling = SignalingState::HaveRemoteOffer;
            }
            SdpType::Answer => {
                if state.signaling != SignalingState::HaveLocalOffer {
                    return Err(PeerError::Negotiation("answer without local offer".to_string()));
                }
                state.signaling = SignalingState::Stable;
                self.negotiation_completed(&mut state);
            }
        }
        state.has_remote_description = true;
        state.remote_descriptions += 1;

        for (kind, track_id) in parse_tracks(&description.sdp) {
            if state.announced_tracks.insert(track_id.clone()) {
                self.push(TransportEvent::RemoteTrack { kind, track_id });
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        if state.signaling != SignalingState::HaveLocalOffer {
            return Err(PeerError::Negotiation("nothing to roll back".to_string()));
        }
        state.signaling = SignalingState::Stable;
        state.rollbacks += 1;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        if !state.has_remote_description {
            return Err(PeerError::Negotiation("no remote description".to_string()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, kind: TrackKind, track: &MediaTrack) -> Result<SenderId, PeerError> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        let id = SenderId(state.senders.len() as u32 + 1);
        state.senders.push((id, kind, Some(track.clone())));
        Ok(id)
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<&MediaTrack>,
    ) -> Result<(), PeerError> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        let slot = state
            .senders
            .iter_mut()
            .find(|(id, _, _)| *id == sender)
            .ok_or_else(|| PeerError::Transport(format!("unknown sender {}", sender.0)))?;
        slot.2 = track.cloned();
        Ok(())
    }

    async fn restart_ice(&self) -> Result<(), PeerError> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        state.ice_restarts += 1;
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        let state = self.state.lock().unwrap();
        if state.closed {
            SignalingState::Closed
        } else {
            state.signaling
        }
    }

    async fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.ice = IceState::Closed;
    }
}

/// Factory handing out `MockPeerConnection`s and keeping their handles.
#[derive(Clone)]
pub struct MockPeerFactory {
    created: Arc<Mutex<Vec<MockPeerHandle>>>,
    auto_connect: bool,
    fail_next: Arc<Mutex<bool>>,
}

impl Default for MockPeerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPeerFactory {
    pub fn new() -> Self {
        Self {
            created: Arc::new(Mutex::new(Vec::new())),
            auto_connect: true,
            fail_next: Arc::new(Mutex::new(false)),
        }
    }

    /// Connections stay in `new` until the test drives ICE itself.
    pub fn manual_ice() -> Self {
        Self {
            auto_connect: false,
            ..Self::new()
        }
    }

    pub fn fail_next_create(&self) {
        *self.fail_next.lock().unwrap() = true;
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn connections_for(&self, remote: &UserId) -> Vec<MockPeerHandle> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|handle| handle.remote() == *remote)
            .cloned()
            .collect()
    }

    pub fn latest_for(&self, remote: &UserId) -> Option<MockPeerHandle> {
        self.connections_for(remote).pop()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(
        &self,
        remote: &UserId,
        _ice_servers: &[IceServer],
    ) -> Result<(Box<dyn PeerConnection>, mpsc::Receiver<TransportEvent>), PeerError> {
        if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
            return Err(PeerError::Transport("scripted create failure".to_string()));
        }
        let (connection, handle, events) = MockPeerConnection::new(remote.clone(), self.auto_connect);
        self.created.lock().unwrap().push(handle);
        Ok((Box::new(connection), events))
    }
}
