//! Local screen share: capture, sender swapping and status whispers.
//!
//! Senders are never removed. Starting a share swaps the capture tracks onto
//! the existing senders; stopping swaps the camera and microphone back, or
//! leaves the sender silent when that device is off.

use meshcall_common::PeerId;
use tracing::{debug, info};

use crate::error::MeshError;
use crate::media::{DisplayCapture, MediaStream, TrackKind};
use crate::signal::SignalData;

use super::actor::RoomActor;
use super::types::{Command, RoomEvent};

/// The display capture currently being sent.
#[derive(Debug)]
pub(super) struct ActiveShare {
    pub(super) stream: MediaStream,
}

impl RoomActor {
    /// Start sharing, replacing any share already running. If the new
    /// capture cannot be acquired the running share is left as it was.
    pub(super) async fn start_share(&mut self) -> Result<(), MeshError> {
        let DisplayCapture { stream, ended } = match self.devices.display_media().await {
            Ok(capture) => capture,
            Err(e) => return Err(self.media_failed(e)),
        };

        let restarted = match self.share.take() {
            Some(previous) => {
                debug!(stream = %previous.stream.id, "Replacing running screen share");
                for track in &previous.stream.tracks {
                    self.devices.stop_track(track);
                }
                true
            }
            None => false,
        };

        let stream_id = stream.id.clone();
        info!(stream = %stream_id, audio = stream.has(TrackKind::Audio), "Screen share started");
        self.share = Some(ActiveShare { stream });

        for peer in self.peer_ids() {
            self.sync_senders(&peer).await;
            // Peers already know from the previous share.
            if !restarted {
                self.relay
                    .send(&peer, SignalData::ScreenShareStatus { is_sharing: true })
                    .await;
            }
            self.negotiate(&peer).await;
        }

        let commands = self.command_tx.clone();
        tokio::spawn(async move {
            if ended.await.is_ok() {
                if let Some(commands) = commands.upgrade() {
                    let _ = commands.send(Command::ShareEnded { stream_id });
                }
            }
        });

        self.events.publish(RoomEvent::ScreenShareStarted);
        Ok(())
    }

    /// Stop sharing and restore camera and microphone. Does nothing when no
    /// share is running.
    pub(super) async fn stop_share(&mut self) {
        let Some(share) = self.share.take() else {
            return;
        };
        for track in &share.stream.tracks {
            self.devices.stop_track(track);
        }
        info!(stream = %share.stream.id, "Screen share stopped");

        for peer in self.peer_ids() {
            self.sync_senders(&peer).await;
            self.relay
                .send(&peer, SignalData::ScreenShareStatus { is_sharing: false })
                .await;
            self.negotiate(&peer).await;
        }
        self.events.publish(RoomEvent::ScreenShareStopped);
    }

    /// Make the audio and video senders of `peer` carry the desired tracks.
    /// Existing senders get their track replaced; a sender is added only when
    /// none of that kind exists.
    pub(super) async fn sync_senders(&self, peer: &PeerId) {
        let Some(connection) = self.peers.get(peer).map(|e| e.connection.clone()) else {
            return;
        };
        let senders = connection.senders();

        for kind in [TrackKind::Audio, TrackKind::Video] {
            let desired = self.desired_track(kind);
            let desired_id = desired.as_ref().map(|(track, _)| track.id.as_str());

            let result = match senders.iter().find(|s| s.kind == kind) {
                Some(sender) if sender.track_id.as_deref() == desired_id => Ok(()),
                Some(sender) => {
                    debug!(peer = %peer, ?kind, track = ?desired_id, "Replacing sender track");
                    connection
                        .replace_track(&sender.id, desired.as_ref().map(|(track, _)| track))
                        .await
                }
                None => match &desired {
                    Some((track, stream)) => connection.add_track(track, stream).map(|_| ()),
                    None => Ok(()),
                },
            };
            if let Err(e) = result {
                self.peer_error(peer, &e);
            }
        }
    }
}
