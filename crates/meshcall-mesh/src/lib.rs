//! Full-mesh WebRTC calls signaled over a realtime presence channel.
//!
//! Every participant keeps one peer connection to every other participant.
//! The WebRTC engine is supplied by the host through the traits in
//! [`media`]; this crate decides who offers, relays the signaling, and keeps
//! the per-participant view the UI renders.

pub mod classify;
pub mod error;
pub mod media;
pub mod participant;
pub mod peer;
pub mod room;
pub mod signal;

pub use classify::{classify, Classification, Rule, Slot};
pub use error::{MediaError, MeshError};
pub use media::{
    DisplayCapture, IceCandidate, MediaDevices, MediaStream, MediaTrack, PeerConnection,
    PeerConnectionFactory, PeerConnectionState, PeerEvent, PeerEventSink, SdpType, SenderId,
    SenderInfo, SessionDescription, SignalingState, TrackKind,
};
pub use participant::{Participant, ParticipantEvent, Participants};
pub use peer::{is_initiator, CandidateQueue, PeerPhase};
pub use room::{Room, RoomConfig, RoomEvent};
pub use signal::{SignalData, SignalEnvelope, SignalRelay, Whisper};
