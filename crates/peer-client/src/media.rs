//! Local media handle.
//!
//! Every link watches the same [`LocalMedia`]. Swapping a track (camera on,
//! screen share started) publishes new [`LocalTracks`] and each link syncs
//! its senders. Muting does not publish anything: it flips the enabled flag
//! shared by every clone of the track, so the negotiated senders keep
//! running and the remote side sees silence or black frames.

use crate::transport::TrackKind;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// A local capture track.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
}

impl MediaTrack {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind
    }
}

impl Eq for MediaTrack {}

/// The tracks currently offered to every remote participant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalTracks {
    pub audio: Option<MediaTrack>,
    pub video: Option<MediaTrack>,
    pub screen: Option<MediaTrack>,
}

impl LocalTracks {
    /// True if there is anything to send.
    #[must_use]
    pub fn has_media(&self) -> bool {
        self.audio.is_some() || self.video.is_some() || self.screen.is_some()
    }

    /// The track that should be on the sender of `kind`.
    ///
    /// A screen share takes the video sender's place while it runs.
    #[must_use]
    pub fn outbound(&self, kind: TrackKind) -> Option<&MediaTrack> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.screen.as_ref().or(self.video.as_ref()),
        }
    }
}

/// Shared, observable local media state.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    tracks: Arc<watch::Sender<LocalTracks>>,
}

impl Default for LocalMedia {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalMedia {
    #[must_use]
    pub fn new() -> Self {
        Self::with_tracks(LocalTracks::default())
    }

    #[must_use]
    pub fn with_tracks(tracks: LocalTracks) -> Self {
        let (tracks, _) = watch::channel(tracks);
        Self {
            tracks: Arc::new(tracks),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LocalTracks> {
        self.tracks.subscribe()
    }

    #[must_use]
    pub fn current(&self) -> LocalTracks {
        self.tracks.borrow().clone()
    }

    #[must_use]
    pub fn has_media(&self) -> bool {
        self.tracks.borrow().has_media()
    }

    pub fn set_audio(&self, track: Option<MediaTrack>) {
        self.tracks.send_modify(|tracks| tracks.audio = track);
    }

    pub fn set_video(&self, track: Option<MediaTrack>) {
        self.tracks.send_modify(|tracks| tracks.video = track);
    }

    /// Mute or unmute the microphone. Returns false if there is no audio track.
    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        Self::toggle(self.tracks.borrow().audio.as_ref(), enabled)
    }

    /// Turn the camera on or off. Returns false if there is no camera track.
    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        Self::toggle(self.tracks.borrow().video.as_ref(), enabled)
    }

    pub fn start_screen_share(&self, track: MediaTrack) {
        self.tracks.send_modify(|tracks| tracks.screen = Some(track));
    }

    pub fn stop_screen_share(&self) {
        self.tracks.send_if_modified(|tracks| tracks.screen.take().is_some());
    }

    fn toggle(track: Option<&MediaTrack>, enabled: bool) -> bool {
        match track {
            Some(track) => {
                track.set_enabled(enabled);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn camera_and_mic() -> LocalMedia {
        LocalMedia::with_tracks(LocalTracks {
            audio: Some(MediaTrack::new("mic", TrackKind::Audio)),
            video: Some(MediaTrack::new("cam", TrackKind::Video)),
            screen: None,
        })
    }

    #[test]
    fn test_toggle_flips_shared_flag_without_publishing() {
        let media = camera_and_mic();
        let mut rx = media.subscribe();
        let held = media.current().audio.unwrap();

        assert!(media.set_audio_enabled(false));
        assert!(!held.is_enabled());
        assert!(!rx.has_changed().unwrap());

        assert!(media.set_audio_enabled(true));
        assert!(held.is_enabled());
    }

    #[test]
    fn test_toggle_without_track() {
        let media = LocalMedia::new();
        assert!(!media.set_video_enabled(false));
        assert!(!media.has_media());
    }

    #[test]
    fn test_screen_share_takes_video_sender() {
        let media = camera_and_mic();
        media.start_screen_share(MediaTrack::new("screen", TrackKind::Video));
        let tracks = media.current();
        assert_eq!(tracks.outbound(TrackKind::Video).unwrap().id(), "screen");

        media.stop_screen_share();
        let tracks = media.current();
        assert_eq!(tracks.outbound(TrackKind::Video).unwrap().id(), "cam");
    }

    #[test]
    fn test_stop_without_share_does_not_publish() {
        let media = camera_and_mic();
        let mut rx = media.subscribe();
        media.stop_screen_share();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_track_swap_publishes() {
        let media = camera_and_mic();
        let mut rx = media.subscribe();
        media.set_video(None);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().video.is_none());
    }
}
