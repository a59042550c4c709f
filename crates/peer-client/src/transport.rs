//! Transport seam between the negotiation logic and a WebRTC stack.
//!
//! The link code drives a [`PeerConnection`] and consumes the
//! [`TransportEvent`]s produced for it. A real implementation wraps a
//! WebRTC peer connection; tests use a scripted in-memory double.
//!
//! Descriptions and candidates cross the relay as opaque JSON payloads:
//!
//! ```text
//! offer/answer:  {"type": "offer", "sdp": "..."}
//! ice-candidate: {"candidate": "...", "sdpMid": "0", "sdpMLineIndex": 0}
//! ```

use crate::error::PeerError;
use crate::media::MediaTrack;

use async_trait::async_trait;
use common::types::UserId;
use serde::{Deserialize, Serialize};
use signaling_protocol::IceServer;
use std::fmt;
use tokio::sync::mpsc;

/// Whether a description is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description as exchanged over the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Signaling state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// ICE connection state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for IceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IceState::New => "new",
            IceState::Checking => "checking",
            IceState::Connected => "connected",
            IceState::Disconnected => "disconnected",
            IceState::Failed => "failed",
            IceState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Kind of media carried by a track or sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Identifies an outbound sender on one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u32);

/// Events raised by a peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A local candidate was gathered and must be trickled to the remote side.
    LocalCandidate(IceCandidate),
    IceStateChanged(IceState),
    /// The connection wants a new offer for changes it made on its own.
    NegotiationNeeded,
    /// The remote side started sending a track.
    RemoteTrack { kind: TrackKind, track_id: String },
}

/// One WebRTC peer connection.
///
/// `add_track` does not need to raise `NegotiationNeeded`; the link offers
/// on its own after adding a sender.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;

    /// Discard a local offer and return to `Stable`.
    async fn rollback(&self) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn add_track(&self, kind: TrackKind, track: &MediaTrack) -> Result<SenderId, PeerError>;

    /// Swap the track on an existing sender without renegotiation.
    /// `None` detaches the sender's track; the sender itself stays.
    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<&MediaTrack>,
    ) -> Result<(), PeerError>;

    /// Mark the ICE agent for restart; the next offer must carry the restart flag.
    async fn restart_ice(&self) -> Result<(), PeerError>;

    fn signaling_state(&self) -> SignalingState;

    async fn close(&self);
}

/// Builds peer connections for remote participants.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        remote: &UserId,
        ice_servers: &[IceServer],
    ) -> Result<(Box<dyn PeerConnection>, mpsc::Receiver<TransportEvent>), PeerError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_description_payload_shape() {
        let value = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert_eq!(value, serde_json::json!({"type": "offer", "sdp": "v=0"}));

        let parsed: SessionDescription =
            serde_json::from_value(serde_json::json!({"type": "answer", "sdp": "v=1"})).unwrap();
        assert_eq!(parsed, SessionDescription::answer("v=1"));
    }

    #[test]
    fn test_candidate_payload_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);

        let minimal: IceCandidate =
            serde_json::from_value(serde_json::json!({"candidate": "c"})).unwrap();
        assert_eq!(minimal.sdp_mid, None);
        assert_eq!(minimal.sdp_mline_index, None);
    }
}
