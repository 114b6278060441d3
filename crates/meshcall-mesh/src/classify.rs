//! Camera vs. screen-share classification of incoming tracks.
//!
//! Video decision table, first match wins:
//!
//! | rule             | condition                                         | slot   |
//! |------------------|---------------------------------------------------|--------|
//! | `SignaledFlag`   | the peer signaled `isSharing: true`               | screen |
//! | `Label`          | label names a screen, display, window or monitor  | screen |
//! | `SecondaryTrack` | the stream already has another video track first  | screen |
//! | `Default`        | anything else                                     | camera |
//!
//! Audio follows the active source: the screen slot while the peer signals
//! that it is sharing, the camera slot otherwise.

use crate::media::{MediaStream, MediaTrack, TrackKind};

const SCREEN_LABEL_HINTS: [&str; 4] = ["screen", "display", "window", "monitor"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Camera,
    Screen,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Self::Camera => Self::Screen,
            Self::Screen => Self::Camera,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::Screen => "screen",
        }
    }
}

/// Which row of the decision table matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    SignaledFlag,
    Label,
    SecondaryTrack,
    Default,
    AudioFollowsActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub slot: Slot,
    pub rule: Rule,
}

/// Classify `track`, which arrived as part of `stream`.
pub fn classify(track: &MediaTrack, stream: &MediaStream, remote_sharing: bool) -> Classification {
    if track.kind == TrackKind::Audio {
        let slot = if remote_sharing {
            Slot::Screen
        } else {
            Slot::Camera
        };
        return Classification {
            slot,
            rule: Rule::AudioFollowsActive,
        };
    }

    let (slot, rule) = if remote_sharing {
        (Slot::Screen, Rule::SignaledFlag)
    } else if label_suggests_screen(&track.label) {
        (Slot::Screen, Rule::Label)
    } else if is_secondary_video(track, stream) {
        (Slot::Screen, Rule::SecondaryTrack)
    } else {
        (Slot::Camera, Rule::Default)
    };
    Classification { slot, rule }
}

fn label_suggests_screen(label: &str) -> bool {
    let label = label.to_ascii_lowercase();
    SCREEN_LABEL_HINTS.iter().any(|hint| label.contains(hint))
}

/// True when another video track precedes `track` in the stream.
fn is_secondary_video(track: &MediaTrack, stream: &MediaStream) -> bool {
    stream
        .first(TrackKind::Video)
        .is_some_and(|first| first.id != track.id)
}
