//! Configuration, events and commands for a room.

use meshcall_common::PeerId;
use meshcall_realtime::Member;
use tokio::sync::oneshot;

use crate::error::MeshError;
use crate::peer::PeerPhase;
use crate::signal::SignalEnvelope;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Whisper event carrying signaling envelopes (sent as `client-{event}`).
    pub signal_event: String,
    /// Acquire the camera when the room starts.
    pub start_with_camera: bool,
    /// Acquire the microphone when the room starts.
    pub start_with_mic: bool,
    /// Capacity of the room event bus.
    pub event_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            signal_event: "signal".into(),
            start_with_camera: true,
            start_with_mic: true,
            event_capacity: 256,
        }
    }
}

impl RoomConfig {
    /// Presence channel name for `room_id`, before the `presence-` prefix.
    pub fn channel_name(room_id: &str) -> String {
        format!("room.{room_id}")
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events published by a room.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    ParticipantJoined(PeerId),
    ParticipantLeft(PeerId),
    PeerStateChanged { peer: PeerId, state: PeerPhase },
    /// A failure scoped to one peer. Other peers are unaffected.
    PeerError { peer: PeerId, error: String },
    /// Camera, microphone or display capture could not be acquired.
    MediaFailed(String),
    ChannelError(String),
    ScreenShareStarted,
    ScreenShareStopped,
    Left,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub(crate) type Reply<T> = oneshot::Sender<Result<T, MeshError>>;

pub(crate) enum Command {
    Roster(Vec<Member>),
    MemberJoined(Member),
    MemberLeft(PeerId),
    Signal(SignalEnvelope),
    ChannelError(String),
    ToggleCamera(Reply<bool>),
    ToggleMic(Reply<bool>),
    StartShare(Reply<()>),
    StopShare(Reply<()>),
    /// The display capture with this stream id was ended outside the app.
    ShareEnded { stream_id: String },
    Leave(oneshot::Sender<()>),
    /// Acknowledged once every earlier command has been handled.
    #[cfg(test)]
    Barrier(oneshot::Sender<()>),
}
