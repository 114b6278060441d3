//! The room orchestrator task.
//!
//! One task owns every peer connection, the candidate queues and the
//! participant map. Presence changes, signals, intents and platform
//! callbacks all arrive as messages and are handled one at a time, so no
//! state is shared and every teardown happens in a single step.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use meshcall_common::{EventBus, PeerId};
use meshcall_realtime::Member;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{MediaError, MeshError};
use crate::media::{
    IceCandidate, MediaDevices, MediaStream, MediaTrack, PeerConnection, PeerConnectionFactory,
    PeerConnectionState, PeerEvent, PeerEventSink, PeerNotice, SdpType, SessionDescription,
    SignalingState, TrackKind,
};
use crate::participant::{Participant, ParticipantEvent, Participants};
use crate::peer::{is_initiator, PeerEntry, PeerPhase};
use crate::signal::{SignalData, SignalEnvelope, SignalRelay};

use super::screen_share::ActiveShare;
use super::types::{Command, RoomConfig, RoomEvent};

/// Local camera and microphone tracks, grouped under one stream id.
#[derive(Debug)]
pub(super) struct LocalMedia {
    pub(super) stream_id: String,
    pub(super) camera: Option<MediaTrack>,
    pub(super) mic: Option<MediaTrack>,
}

impl LocalMedia {
    pub(super) fn stream(&self) -> MediaStream {
        let mut stream = MediaStream::new(self.stream_id.clone());
        for track in self.mic.iter().chain(self.camera.iter()) {
            stream.add_track(track.clone());
        }
        stream
    }
}

pub(super) struct RoomActor {
    pub(super) local: PeerId,
    pub(super) relay: SignalRelay,
    factory: Arc<dyn PeerConnectionFactory>,
    pub(super) devices: Arc<dyn MediaDevices>,
    config: RoomConfig,
    pub(super) peers: HashMap<PeerId, PeerEntry>,
    participants: Participants,
    snapshot: watch::Sender<Participants>,
    pub(super) events: EventBus<RoomEvent>,
    pub(super) media: LocalMedia,
    pub(super) share: Option<ActiveShare>,
    next_epoch: u64,
    notice_tx: mpsc::UnboundedSender<PeerNotice>,
    notices: mpsc::UnboundedReceiver<PeerNotice>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Lets spawned watchers post commands without keeping the room alive.
    pub(super) command_tx: mpsc::WeakUnboundedSender<Command>,
}

impl RoomActor {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        relay: SignalRelay,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        config: RoomConfig,
        snapshot: watch::Sender<Participants>,
        events: EventBus<RoomEvent>,
        commands: mpsc::UnboundedReceiver<Command>,
        command_tx: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        let (notice_tx, notices) = mpsc::unbounded_channel();
        Self {
            local: relay.local().clone(),
            relay,
            factory,
            devices,
            config,
            peers: HashMap::new(),
            participants: Participants::new(),
            snapshot,
            events,
            media: LocalMedia {
                stream_id: meshcall_common::new_id(),
                camera: None,
                mic: None,
            },
            share: None,
            next_epoch: 0,
            notice_tx,
            notices,
            commands,
            command_tx,
        }
    }

    pub(super) async fn run(mut self) {
        self.start_local_media().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Leave(done)) => {
                        self.close();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("Room handles dropped");
                        self.close();
                        break;
                    }
                },
                Some(notice) = self.notices.recv() => self.handle_notice(notice).await,
            }
        }
        info!(local = %self.local, "Room closed");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Roster(members) => self.sync_roster(members).await,
            Command::MemberJoined(member) => {
                let name = member.name().map(str::to_string);
                self.ensure_peer(&member.id, name).await;
            }
            Command::MemberLeft(peer) => self.teardown(&peer),
            Command::Signal(envelope) => self.handle_signal(envelope).await,
            Command::ChannelError(error) => {
                warn!(error = %error, "Room channel error");
                self.events.publish(RoomEvent::ChannelError(error));
            }
            Command::ToggleCamera(reply) => {
                let _ = reply.send(self.toggle(TrackKind::Video).await);
            }
            Command::ToggleMic(reply) => {
                let _ = reply.send(self.toggle(TrackKind::Audio).await);
            }
            Command::StartShare(reply) => {
                let _ = reply.send(self.start_share().await);
            }
            Command::StopShare(reply) => {
                self.stop_share().await;
                let _ = reply.send(Ok(()));
            }
            Command::ShareEnded { stream_id } => {
                if self.share.as_ref().is_some_and(|s| s.stream.id == stream_id) {
                    info!("Display capture ended");
                    self.stop_share().await;
                }
            }
            // Handled by the loop.
            Command::Leave(done) => {
                let _ = done.send(());
            }
            #[cfg(test)]
            Command::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Local media
    // -----------------------------------------------------------------------

    async fn start_local_media(&mut self) {
        let (audio, video) = (self.config.start_with_mic, self.config.start_with_camera);
        if !audio && !video {
            return;
        }
        match self.devices.user_media(audio, video).await {
            Ok(stream) => {
                self.media.stream_id = stream.id.clone();
                self.media.mic = stream.first(TrackKind::Audio).cloned();
                self.media.camera = stream.first(TrackKind::Video).cloned();
                info!(
                    camera = self.media.camera.is_some(),
                    mic = self.media.mic.is_some(),
                    "Local media started"
                );
            }
            Err(e) => {
                // The call continues without local media.
                self.media_failed(e);
            }
        }
    }

    /// Flip the camera (video) or microphone (audio). Returns whether the
    /// device is now enabled.
    async fn toggle(&mut self, kind: TrackKind) -> Result<bool, MeshError> {
        let slot = match kind {
            TrackKind::Video => &mut self.media.camera,
            TrackKind::Audio => &mut self.media.mic,
        };
        let enabled = match slot.take() {
            Some(track) => {
                self.devices.stop_track(&track);
                false
            }
            None => {
                let (audio, video) = (kind == TrackKind::Audio, kind == TrackKind::Video);
                let stream = match self.devices.user_media(audio, video).await {
                    Ok(stream) => stream,
                    Err(e) => return Err(self.media_failed(e)),
                };
                let Some(track) = stream.first(kind).cloned() else {
                    return Err(self.media_failed(MediaError::DeviceUnavailable(format!(
                        "no {kind:?} track"
                    ))));
                };
                match kind {
                    TrackKind::Video => self.media.camera = Some(track),
                    TrackKind::Audio => self.media.mic = Some(track),
                }
                true
            }
        };
        info!(?kind, enabled, "Local device toggled");
        self.media_changed().await;
        Ok(enabled)
    }

    pub(super) fn media_failed(&self, error: MediaError) -> MeshError {
        warn!(error = %error, "Media acquisition failed");
        self.events.publish(RoomEvent::MediaFailed(error.to_string()));
        MeshError::Media(error)
    }

    /// Track the sender of `kind` should carry right now, with its stream.
    /// A screen share takes over video, and audio too when it has any.
    pub(super) fn desired_track(&self, kind: TrackKind) -> Option<(MediaTrack, MediaStream)> {
        if let Some(share) = &self.share {
            if let Some(track) = share.stream.first(kind) {
                return Some((track.clone(), share.stream.clone()));
            }
        }
        let track = match kind {
            TrackKind::Video => self.media.camera.as_ref(),
            TrackKind::Audio => self.media.mic.as_ref(),
        }?;
        Some((track.clone(), self.media.stream()))
    }

    /// Push the current local tracks to every peer and renegotiate where we
    /// are the initiator.
    pub(super) async fn media_changed(&mut self) {
        for peer in self.peer_ids() {
            self.sync_senders(&peer).await;
            self.negotiate(&peer).await;
        }
    }

    pub(super) fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Peer lifecycle
    // -----------------------------------------------------------------------

    async fn sync_roster(&mut self, members: Vec<Member>) {
        let present: HashSet<PeerId> = members.iter().map(|m| m.id.clone()).collect();
        for stale in self.peer_ids() {
            if !present.contains(&stale) {
                debug!(peer = %stale, "Peer missing from roster");
                self.teardown(&stale);
            }
        }
        for member in members {
            let name = member.name().map(str::to_string);
            self.ensure_peer(&member.id, name).await;
        }
    }

    /// Create the connection for `peer` unless it exists. Local tracks are
    /// attached before any offer is made.
    async fn ensure_peer(&mut self, peer: &PeerId, name: Option<String>) -> bool {
        if *peer == self.local {
            return false;
        }
        if self.peers.contains_key(peer) {
            return true;
        }

        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let sink = PeerEventSink::new(peer.clone(), epoch, self.notice_tx.clone());
        let connection = match self.factory.create(peer, sink) {
            Ok(connection) => connection,
            Err(e) => {
                self.peer_error(peer, &e);
                return false;
            }
        };

        for kind in [TrackKind::Audio, TrackKind::Video] {
            let attached = match self.desired_track(kind) {
                Some((track, stream)) => connection.add_track(&track, &stream),
                None => connection.add_transceiver(kind),
            };
            if let Err(e) = attached {
                self.peer_error(peer, &e);
            }
        }

        let initiator = is_initiator(&self.local, peer);
        info!(peer = %peer, initiator, "Peer connection created");
        self.peers
            .insert(peer.clone(), PeerEntry::new(connection, epoch, initiator));
        self.participants
            .insert(peer.clone(), Participant::new(peer.clone(), name));
        self.publish_participants();
        self.events.publish(RoomEvent::ParticipantJoined(peer.clone()));

        if self.share.is_some() {
            self.relay
                .send(peer, SignalData::ScreenShareStatus { is_sharing: true })
                .await;
        }
        if initiator {
            self.negotiate(peer).await;
        }
        true
    }

    /// Close and forget `peer`. Connection, entry and participant go
    /// together, and a second call does nothing.
    fn teardown(&mut self, peer: &PeerId) {
        let Some(entry) = self.peers.remove(peer) else {
            return;
        };
        entry.connection.close();
        self.participants.remove(peer);
        self.publish_participants();
        info!(peer = %peer, "Peer torn down");
        self.events.publish(RoomEvent::PeerStateChanged {
            peer: peer.clone(),
            state: PeerPhase::Closed,
        });
        self.events.publish(RoomEvent::ParticipantLeft(peer.clone()));
    }

    fn fail_peer(&mut self, peer: &PeerId, error: MediaError) {
        self.peer_error(peer, &error);
        self.teardown(peer);
    }

    pub(super) fn peer_error(&self, peer: &PeerId, error: &MediaError) {
        warn!(peer = %peer, error = %error, "Peer error");
        self.events.publish(RoomEvent::PeerError {
            peer: peer.clone(),
            error: error.to_string(),
        });
    }

    fn set_phase(&mut self, peer: &PeerId, phase: PeerPhase) {
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        if entry.phase != phase {
            entry.phase = phase;
            self.events.publish(RoomEvent::PeerStateChanged {
                peer: peer.clone(),
                state: phase,
            });
        }
    }

    fn connection(&self, peer: &PeerId) -> Option<Arc<dyn PeerConnection>> {
        self.peers.get(peer).map(|e| Arc::clone(&e.connection))
    }

    fn close(&mut self) {
        for peer in self.peer_ids() {
            self.teardown(&peer);
        }
        let tracks = self
            .media
            .camera
            .take()
            .into_iter()
            .chain(self.media.mic.take())
            .chain(self.share.take().into_iter().flat_map(|s| s.stream.tracks));
        for track in tracks {
            self.devices.stop_track(&track);
        }
        self.events.publish(RoomEvent::Left);
    }

    fn publish_participants(&self) {
        self.snapshot.send_replace(self.participants.clone());
    }

    fn update_participant(&mut self, peer: &PeerId, event: ParticipantEvent) {
        let Some(current) = self.participants.get(peer) else {
            return;
        };
        let next = current.apply(&event);
        if next != *current {
            self.participants.insert(peer.clone(), next);
            self.publish_participants();
        }
    }

    // -----------------------------------------------------------------------
    // Negotiation
    // -----------------------------------------------------------------------

    /// Send a fresh offer to `peer` if we are its initiator. Deferred while
    /// an earlier offer is still unanswered.
    pub(super) async fn negotiate(&mut self, peer: &PeerId) {
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        if !entry.initiator {
            return;
        }
        if entry.connection.signaling_state() != SignalingState::Stable {
            debug!(peer = %peer, "Renegotiation deferred");
            entry.renegotiate_pending = true;
            return;
        }
        entry.renegotiate_pending = false;
        let connection = Arc::clone(&entry.connection);
        self.set_phase(peer, PeerPhase::Negotiating);

        let offer = async {
            let offer = connection.create_offer().await?;
            connection.set_local_description(offer.clone()).await?;
            Ok::<_, MediaError>(offer)
        }
        .await;
        match offer {
            Ok(sdp) => {
                self.relay.send(peer, SignalData::Offer { sdp }).await;
            }
            Err(e) => self.fail_peer(peer, e),
        }
    }

    async fn handle_signal(&mut self, envelope: SignalEnvelope) {
        let SignalEnvelope { from, to, data } = envelope;
        if to != self.local || from == self.local {
            return;
        }
        debug!(peer = %from, kind = data.kind(), "Signal received");
        match data {
            SignalData::Offer { sdp } => self.handle_offer(&from, sdp).await,
            SignalData::Answer { sdp } => self.handle_answer(&from, sdp).await,
            SignalData::Candidate { candidate } => self.handle_candidate(&from, candidate).await,
            SignalData::ScreenShareStatus { is_sharing } => {
                if self.ensure_peer(&from, None).await {
                    self.update_participant(&from, ParticipantEvent::ScreenShareStatus(is_sharing));
                }
            }
        }
    }

    async fn handle_offer(&mut self, peer: &PeerId, sdp: SessionDescription) {
        if !self.ensure_peer(peer, None).await {
            return;
        }
        let Some(entry) = self.peers.get(peer) else {
            return;
        };
        if entry.initiator || sdp.sdp_type != SdpType::Offer {
            self.fail_peer(peer, MediaError::InvalidDescription("unexpected offer".into()));
            return;
        }
        let connection = Arc::clone(&entry.connection);
        self.set_phase(peer, PeerPhase::Negotiating);

        if let Err(e) = connection.set_remote_description(sdp).await {
            self.fail_peer(peer, e);
            return;
        }
        self.remote_description_applied(peer, &connection).await;

        let answer = async {
            let answer = connection.create_answer().await?;
            connection.set_local_description(answer.clone()).await?;
            Ok::<_, MediaError>(answer)
        }
        .await;
        match answer {
            Ok(sdp) => {
                self.relay.send(peer, SignalData::Answer { sdp }).await;
            }
            Err(e) => self.fail_peer(peer, e),
        }
    }

    async fn handle_answer(&mut self, peer: &PeerId, sdp: SessionDescription) {
        let Some(entry) = self.peers.get(peer) else {
            debug!(peer = %peer, "Answer from unknown peer ignored");
            return;
        };
        let awaiting = entry.initiator
            && entry.connection.signaling_state() == SignalingState::HaveLocalOffer;
        if !awaiting || sdp.sdp_type != SdpType::Answer {
            self.fail_peer(peer, MediaError::InvalidDescription("unexpected answer".into()));
            return;
        }
        let connection = Arc::clone(&entry.connection);

        if let Err(e) = connection.set_remote_description(sdp).await {
            self.fail_peer(peer, e);
            return;
        }
        self.remote_description_applied(peer, &connection).await;

        let pending = self
            .peers
            .get(peer)
            .is_some_and(|entry| entry.renegotiate_pending);
        if pending {
            self.negotiate(peer).await;
        }
    }

    async fn handle_candidate(&mut self, peer: &PeerId, candidate: IceCandidate) {
        if !self.ensure_peer(peer, None).await {
            return;
        }
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        if !entry.remote_description_set {
            entry.candidates.push(candidate);
            debug!(peer = %peer, queued = entry.candidates.len(), "Candidate queued");
            return;
        }
        let connection = Arc::clone(&entry.connection);
        self.apply_candidate(peer, &connection, candidate).await;
    }

    /// Mark the remote description as set and flush queued candidates in
    /// arrival order.
    async fn remote_description_applied(
        &mut self,
        peer: &PeerId,
        connection: &Arc<dyn PeerConnection>,
    ) {
        let queued = match self.peers.get_mut(peer) {
            Some(entry) => {
                entry.remote_description_set = true;
                entry.candidates.drain()
            }
            None => return,
        };
        if !queued.is_empty() {
            debug!(peer = %peer, count = queued.len(), "Flushing queued candidates");
        }
        for candidate in queued {
            self.apply_candidate(peer, connection, candidate).await;
        }
    }

    async fn apply_candidate(
        &self,
        peer: &PeerId,
        connection: &Arc<dyn PeerConnection>,
        candidate: IceCandidate,
    ) {
        match connection.add_ice_candidate(candidate).await {
            Ok(()) => {}
            Err(e) if e.is_benign_candidate_error() => {
                debug!(peer = %peer, error = %e, "Candidate ignored");
            }
            Err(e) => self.peer_error(peer, &e),
        }
    }

    // -----------------------------------------------------------------------
    // Platform callbacks
    // -----------------------------------------------------------------------

    async fn handle_notice(&mut self, notice: PeerNotice) {
        let PeerNotice { peer, epoch, event } = notice;
        if self.peers.get(&peer).map(|e| e.epoch) != Some(epoch) {
            debug!(peer = %peer, epoch, "Event from a replaced connection ignored");
            return;
        }
        match event {
            PeerEvent::IceCandidate(candidate) => {
                self.relay
                    .send(&peer, SignalData::Candidate { candidate })
                    .await;
            }
            PeerEvent::Track { track, stream } => {
                debug!(peer = %peer, track = %track.id, stream = %stream.id, "Remote track");
                self.update_participant(&peer, ParticipantEvent::TrackAdded { track, stream });
            }
            PeerEvent::TrackMuted { track_id, muted } => {
                self.update_participant(&peer, ParticipantEvent::TrackMuted { track_id, muted });
            }
            PeerEvent::TrackEnded { track_id } => {
                self.update_participant(&peer, ParticipantEvent::TrackEnded { track_id });
            }
            PeerEvent::ConnectionState(state) => {
                debug!(peer = %peer, ?state, "Connection state");
                match state {
                    PeerConnectionState::Connected => self.set_phase(&peer, PeerPhase::Connected),
                    PeerConnectionState::Disconnected => {
                        self.set_phase(&peer, PeerPhase::Disconnected);
                        self.teardown(&peer);
                    }
                    s if s.is_terminal() => self.teardown(&peer),
                    _ => {}
                }
            }
        }
    }
}
