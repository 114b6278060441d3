//! Media types and the platform seam.
//!
//! The WebRTC engine itself lives outside this crate. It is reached through
//! [`PeerConnectionFactory`], [`PeerConnection`] and [`MediaDevices`];
//! platform callbacks come back through a [`PeerEventSink`].

use std::sync::Arc;

use async_trait::async_trait;
use meshcall_common::PeerId;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::MediaError;

// ---------------------------------------------------------------------------
// Tracks and streams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    /// Source label reported by the platform (device or surface name).
    pub label: String,
    pub muted: bool,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            muted: false,
        }
    }

    pub fn audio(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(id, TrackKind::Audio, label)
    }

    pub fn video(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(id, TrackKind::Video, label)
    }
}

/// A group of tracks identified by stream id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn with_track(mut self, track: MediaTrack) -> Self {
        self.add_track(track);
        self
    }

    /// Add a track, replacing any track with the same id.
    pub fn add_track(&mut self, track: MediaTrack) {
        match self.tracks.iter_mut().find(|t| t.id == track.id) {
            Some(existing) => *existing = track,
            None => self.tracks.push(track),
        }
    }

    pub fn remove_track(&mut self, track_id: &str) -> Option<MediaTrack> {
        let index = self.tracks.iter().position(|t| t.id == track_id)?;
        Some(self.tracks.remove(index))
    }

    pub fn track(&self, track_id: &str) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.id == track_id)
    }

    pub fn track_mut(&mut self, track_id: &str) -> Option<&mut MediaTrack> {
        self.tracks.iter_mut().find(|t| t.id == track_id)
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    pub fn first(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.tracks_of(kind).next()
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.first(kind).is_some()
    }

    /// Whether any track of `kind` is live (present and not muted).
    pub fn has_live(&self, kind: TrackKind) -> bool {
        self.tracks_of(kind).any(|t| !t.muted)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Session descriptions and candidates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A network-reachability candidate, in the browser's `RTCIceCandidateInit`
/// shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// States after which the connection is torn down.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SenderId(pub String);

/// An outgoing sender: its transceiver kind and current track, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderInfo {
    pub id: SenderId,
    pub kind: TrackKind,
    pub track_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Platform traits
// ---------------------------------------------------------------------------

/// One platform peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Attach a local track in a new sender.
    fn add_track(&self, track: &MediaTrack, stream: &MediaStream) -> Result<SenderId, MediaError>;

    /// Add a sender of `kind` with no track yet, so a track can later be
    /// swapped in without changing the set of transceivers.
    fn add_transceiver(&self, kind: TrackKind) -> Result<SenderId, MediaError>;

    /// Swap the track on an existing sender; `None` leaves the sender silent.
    async fn replace_track(
        &self,
        sender: &SenderId,
        track: Option<&MediaTrack>,
    ) -> Result<(), MediaError>;

    fn senders(&self) -> Vec<SenderInfo>;

    fn signaling_state(&self) -> SignalingState;

    fn close(&self);
}

/// Creates peer connections wired to an event sink.
pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        peer: &PeerId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, MediaError>;
}

/// A display capture and a signal that fires when the user ends it from
/// outside the app.
#[derive(Debug)]
pub struct DisplayCapture {
    pub stream: MediaStream,
    pub ended: oneshot::Receiver<()>,
}

/// Camera, microphone and display capture.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn user_media(&self, audio: bool, video: bool) -> Result<MediaStream, MediaError>;

    async fn display_media(&self) -> Result<DisplayCapture, MediaError>;

    /// Stop a local track and release its device.
    fn stop_track(&self, track: &MediaTrack);
}

// ---------------------------------------------------------------------------
// Peer events
// ---------------------------------------------------------------------------

/// Platform callbacks for one peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local candidate was gathered.
    IceCandidate(IceCandidate),
    /// A remote track arrived, with the stream it belongs to.
    Track { track: MediaTrack, stream: MediaStream },
    TrackMuted { track_id: String, muted: bool },
    TrackEnded { track_id: String },
    ConnectionState(PeerConnectionState),
}

#[derive(Debug)]
pub(crate) struct PeerNotice {
    pub(crate) peer: PeerId,
    pub(crate) epoch: u64,
    pub(crate) event: PeerEvent,
}

/// Where a peer connection reports its callbacks. Events from a connection
/// that has since been replaced or closed are ignored.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    peer: PeerId,
    epoch: u64,
    tx: mpsc::UnboundedSender<PeerNotice>,
}

impl PeerEventSink {
    pub(crate) fn new(peer: PeerId, epoch: u64, tx: mpsc::UnboundedSender<PeerNotice>) -> Self {
        Self { peer, epoch, tx }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send(PeerNotice {
            peer: self.peer.clone(),
            epoch: self.epoch,
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_add_track_replaces_same_id() {
        let mut stream = MediaStream::new("s1").with_track(MediaTrack::video("v1", "cam"));
        let mut muted = MediaTrack::video("v1", "cam");
        muted.muted = true;
        stream.add_track(muted);
        assert_eq!(stream.tracks.len(), 1);
        assert!(!stream.has_live(TrackKind::Video));
        assert!(stream.has(TrackKind::Video));
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
    }

    #[test]
    fn description_serializes_type_field() {
        let json = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "offer", "sdp": "v=0"}));
    }

    #[test]
    fn terminal_connection_states() {
        assert!(PeerConnectionState::Failed.is_terminal());
        assert!(PeerConnectionState::Disconnected.is_terminal());
        assert!(PeerConnectionState::Closed.is_terminal());
        assert!(!PeerConnectionState::Connecting.is_terminal());
        assert!(!PeerConnectionState::Connected.is_terminal());
    }

    #[tokio::test]
    async fn sink_tags_events_with_peer_and_epoch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = PeerEventSink::new(PeerId::from("9"), 4, tx);
        sink.emit(PeerEvent::ConnectionState(PeerConnectionState::Connected));
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.peer, PeerId::from("9"));
        assert_eq!(notice.epoch, 4);
    }
}
