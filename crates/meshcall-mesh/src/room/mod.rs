//! A mesh call room.
//!
//! [`Room`] is the handle the UI holds. Behind it, one orchestrator task owns
//! a peer connection per remote participant, negotiates them over whispers
//! on the room's presence channel, and publishes a participant snapshot
//! after every change.

mod actor;
mod screen_share;
mod types;

#[cfg(test)]
mod tests;

pub use types::{RoomConfig, RoomEvent};

use std::sync::Arc;

use meshcall_common::{EventBus, PeerId};
use meshcall_realtime::{Member, PresenceChannel, RealtimeClient};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::error::MeshError;
use crate::media::{MediaDevices, PeerConnectionFactory};
use crate::participant::Participants;
use crate::signal::{SignalEnvelope, SignalRelay, Whisper};

use actor::RoomActor;
use types::{Command, Reply};

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// Handle to a running room. Clones share the same room.
#[derive(Clone)]
pub struct Room {
    local: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    participants: watch::Receiver<Participants>,
    events: EventBus<RoomEvent>,
    channel: Option<PresenceChannel>,
}

impl Room {
    /// Join `room_id`: open its presence channel, start local media and
    /// connect to every member already there.
    ///
    /// Returns the room and a receiver subscribed before any event was sent.
    pub async fn join(
        client: &RealtimeClient,
        room_id: &str,
        config: RoomConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> Result<(Self, broadcast::Receiver<RoomEvent>), MeshError> {
        let channel = client.presence(&RoomConfig::channel_name(room_id)).await?;
        let Some(me) = channel.me() else {
            channel.leave().await;
            return Err(MeshError::NoLocalMember);
        };
        info!(room = %room_id, local = %me.id, "Joining room");

        let signal_event = config.signal_event.clone();
        let relay = SignalRelay::new(me.id.clone(), signal_event.clone(), Arc::new(channel.clone()));
        let (mut room, events) = Self::spawn(relay.clone(), factory, devices, config);
        room.channel = Some(channel.clone());

        let inbox = room.commands.downgrade();
        let forward = move |command: Command| {
            if let Some(commands) = inbox.upgrade() {
                let _ = commands.send(command);
            }
        };

        let on_signal = forward.clone();
        let on_roster = forward.clone();
        let on_join = forward.clone();
        let on_leave = forward.clone();
        channel
            .listen_for_whisper(&signal_event, move |payload| {
                if let Some(envelope) = relay.accept(payload) {
                    on_signal(Command::Signal(envelope));
                }
            })
            .error(move |e| forward(Command::ChannelError(e.to_string())));
        channel
            .here(move |members| on_roster(Command::Roster(members.to_vec())))
            .joining(move |member| on_join(Command::MemberJoined(member.clone())))
            .leaving(move |member| on_leave(Command::MemberLeft(member.id.clone())));

        Ok((room, events))
    }

    /// Start a room over caller-provided signaling. Presence changes and
    /// inbound envelopes are fed in with the `on_*` methods.
    pub fn with_signaling(
        local: PeerId,
        signal_event: &str,
        whisper: Arc<dyn Whisper>,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        config: RoomConfig,
    ) -> (Self, broadcast::Receiver<RoomEvent>) {
        let relay = SignalRelay::new(local, signal_event, whisper);
        Self::spawn(relay, factory, devices, config)
    }

    fn spawn(
        relay: SignalRelay,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        config: RoomConfig,
    ) -> (Self, broadcast::Receiver<RoomEvent>) {
        let local = relay.local().clone();
        let events = EventBus::new(config.event_capacity);
        let receiver = events.subscribe();
        let (snapshot, participants) = watch::channel(Participants::new());
        let (commands, inbox) = mpsc::unbounded_channel();

        let actor = RoomActor::new(
            relay,
            factory,
            devices,
            config,
            snapshot,
            events.clone(),
            inbox,
            commands.downgrade(),
        );
        tokio::spawn(actor.run());

        let room = Self {
            local,
            commands,
            participants,
            events,
            channel: None,
        };
        (room, receiver)
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    /// Watch the published participant snapshot.
    pub fn participants(&self) -> watch::Receiver<Participants> {
        self.participants.clone()
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Participants {
        self.participants.borrow().clone()
    }

    pub fn events(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    // -- intents --------------------------------------------------------------

    /// Turn the camera on or off. Returns whether it is now on.
    pub async fn toggle_camera(&self) -> Result<bool, MeshError> {
        self.request(Command::ToggleCamera).await
    }

    /// Turn the microphone on or off. Returns whether it is now on.
    pub async fn toggle_mic(&self) -> Result<bool, MeshError> {
        self.request(Command::ToggleMic).await
    }

    /// Share the screen, replacing any share already running.
    pub async fn start_screen_share(&self) -> Result<(), MeshError> {
        self.request(Command::StartShare).await
    }

    pub async fn stop_screen_share(&self) -> Result<(), MeshError> {
        self.request(Command::StopShare).await
    }

    /// Close every peer connection, stop local media and leave the channel.
    /// Safe to call more than once.
    pub async fn leave(&self) {
        let (done, acked) = oneshot::channel();
        if self.commands.send(Command::Leave(done)).is_ok() {
            let _ = acked.await;
        }
        if let Some(channel) = &self.channel {
            channel.leave().await;
        }
    }

    // -- signaling input ------------------------------------------------------

    /// The full member list, as delivered on (re)subscription. Peers missing
    /// from it are torn down.
    pub fn on_roster(&self, members: Vec<Member>) {
        self.post(Command::Roster(members));
    }

    pub fn on_member_joined(&self, member: Member) {
        self.post(Command::MemberJoined(member));
    }

    pub fn on_member_left(&self, peer: PeerId) {
        self.post(Command::MemberLeft(peer));
    }

    /// An inbound envelope. Envelopes not addressed to the local participant
    /// are dropped.
    pub fn on_signal(&self, envelope: SignalEnvelope) {
        self.post(Command::Signal(envelope));
    }

    /// Wait until the room has handled everything posted so far.
    #[cfg(test)]
    pub(crate) async fn barrier(&self) {
        let (done, acked) = oneshot::channel();
        if self.commands.send(Command::Barrier(done)).is_ok() {
            let _ = acked.await;
        }
    }

    fn post(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Room is closed; input dropped");
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, MeshError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| MeshError::RoomClosed)?;
        response.await.map_err(|_| MeshError::RoomClosed)?
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room").field("local", &self.local).finish()
    }
}
