//! Remote participant state as immutable transitions.
//!
//! `Participant::apply` takes the current state and one event and returns
//! the next state. Streams are tracked by stream id: the camera and screen
//! slots never hold streams with the same id.

use std::collections::BTreeMap;

use meshcall_common::PeerId;

use crate::classify::{classify, Slot};
use crate::media::{MediaStream, MediaTrack, TrackKind};

/// Published snapshot of every remote participant, keyed by id.
pub type Participants = BTreeMap<PeerId, Participant>;

/// What the UI sees for one remote participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: PeerId,
    pub name: Option<String>,
    /// A live (unmuted) camera video track is present.
    pub camera_enabled: bool,
    /// A live (unmuted) audio track is present.
    pub mic_enabled: bool,
    pub camera_stream: Option<MediaStream>,
    pub screen_stream: Option<MediaStream>,
    /// The peer signaled that it is sharing its screen.
    pub remote_sharing: bool,
}

/// Inputs that change a participant.
#[derive(Debug, Clone, PartialEq)]
pub enum ParticipantEvent {
    TrackAdded { track: MediaTrack, stream: MediaStream },
    TrackMuted { track_id: String, muted: bool },
    TrackEnded { track_id: String },
    ScreenShareStatus(bool),
}

impl Participant {
    pub fn new(id: PeerId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            camera_enabled: false,
            mic_enabled: false,
            camera_stream: None,
            screen_stream: None,
            remote_sharing: false,
        }
    }

    /// The state after `event`.
    #[must_use]
    pub fn apply(&self, event: &ParticipantEvent) -> Participant {
        let mut next = self.clone();
        match event {
            ParticipantEvent::TrackAdded { track, stream } => {
                let slot = classify(track, stream, next.remote_sharing).slot;
                next.place(slot, track, stream);
            }
            ParticipantEvent::TrackMuted { track_id, muted } => {
                for stream in next.streams_mut() {
                    if let Some(track) = stream.track_mut(track_id) {
                        track.muted = *muted;
                    }
                }
            }
            ParticipantEvent::TrackEnded { track_id } => next.remove_track(track_id),
            ParticipantEvent::ScreenShareStatus(true) => {
                next.remote_sharing = true;
                // The peer swapped its camera sender over to the screen.
                let camera_has_video = next
                    .camera_stream
                    .as_ref()
                    .is_some_and(|s| s.has(TrackKind::Video));
                if next.screen_stream.is_none() && camera_has_video {
                    next.screen_stream = next.camera_stream.take();
                }
            }
            ParticipantEvent::ScreenShareStatus(false) => {
                next.remote_sharing = false;
                if let Some(screen) = next.screen_stream.take() {
                    match next.camera_stream.as_mut() {
                        None => next.camera_stream = Some(screen),
                        Some(camera) => {
                            // Audio follows the camera again.
                            if !camera.has(TrackKind::Audio) {
                                for audio in screen.tracks_of(TrackKind::Audio) {
                                    camera.add_track(audio.clone());
                                }
                            }
                        }
                    }
                }
            }
        }
        next.refresh_flags();
        next
    }

    pub fn stream(&self, slot: Slot) -> Option<&MediaStream> {
        match slot {
            Slot::Camera => self.camera_stream.as_ref(),
            Slot::Screen => self.screen_stream.as_ref(),
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut Option<MediaStream> {
        match slot {
            Slot::Camera => &mut self.camera_stream,
            Slot::Screen => &mut self.screen_stream,
        }
    }

    fn streams_mut(&mut self) -> impl Iterator<Item = &mut MediaStream> {
        self.camera_stream
            .iter_mut()
            .chain(self.screen_stream.iter_mut())
    }

    fn place(&mut self, slot: Slot, track: &MediaTrack, stream: &MediaStream) {
        self.remove_track(&track.id);
        let other_id = self.stream(slot.other()).map(|s| s.id.clone());
        let target = self.slot_mut(slot);

        if let Some(existing) = target.as_mut() {
            if existing.id == stream.id || track.kind == TrackKind::Audio {
                existing.add_track(track.clone());
                return;
            }
        }

        // A video track from a different stream replaces the slot. Audio
        // already attached to the slot stays with it.
        let id = if other_id.as_deref() == Some(stream.id.as_str()) {
            format!("{}#{}", stream.id, slot.as_str())
        } else {
            stream.id.clone()
        };
        let mut replacement = MediaStream::new(id);
        if let Some(old) = target.take() {
            for audio in old.tracks_of(TrackKind::Audio) {
                replacement.add_track(audio.clone());
            }
        }
        replacement.add_track(track.clone());
        *target = Some(replacement);
    }

    fn remove_track(&mut self, track_id: &str) {
        for slot in [Slot::Camera, Slot::Screen] {
            let target = self.slot_mut(slot);
            if let Some(stream) = target.as_mut() {
                stream.remove_track(track_id);
                if stream.is_empty() {
                    *target = None;
                }
            }
        }
    }

    fn refresh_flags(&mut self) {
        self.camera_enabled = self
            .camera_stream
            .as_ref()
            .is_some_and(|s| s.has_live(TrackKind::Video));
        self.mic_enabled = self
            .camera_stream
            .iter()
            .chain(self.screen_stream.iter())
            .any(|s| s.has_live(TrackKind::Audio));
    }
}
