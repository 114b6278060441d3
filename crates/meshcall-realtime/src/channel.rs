//! Per-channel handles returned by the client.

use std::ops::Deref;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::client::{run_deliveries, ClientInner};
use crate::error::RealtimeError;
use crate::frame::{client_event, Frame};
use crate::presence::Member;
use crate::registry::ChannelKind;
use crate::transport::Outbound;

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Handle to one channel subscription.
///
/// Clones refer to the same subscription. Once the subscription is left,
/// every method on every clone becomes a no-op.
#[derive(Clone)]
pub struct Channel {
    client: Arc<ClientInner>,
    name: String,
    kind: ChannelKind,
    generation: u64,
}

impl Channel {
    pub(crate) fn new(
        client: Arc<ClientInner>,
        name: String,
        kind: ChannelKind,
        generation: u64,
    ) -> Self {
        Self {
            client,
            name,
            kind,
            generation,
        }
    }

    /// Wire name of the channel, including any `private-`/`presence-` prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Whether the server has acknowledged the current subscription.
    pub fn is_subscribed(&self) -> bool {
        self.client
            .registry()
            .get(&self.name, self.generation)
            .is_some_and(|sub| sub.subscribed)
    }

    /// Call `callback` with the payload of every `event` frame on this channel.
    /// Registering the same callback twice calls it twice.
    pub fn listen<F>(&self, event: &str, callback: F) -> &Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.client
            .registry()
            .listen(&self.name, self.generation, event, Arc::new(callback));
        self
    }

    /// Listen for whispers sent by other members with [`Channel::whisper`].
    pub fn listen_for_whisper<F>(&self, event: &str, callback: F) -> &Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.listen(&client_event(event), callback)
    }

    /// Called when the server acknowledges the subscription, again after
    /// every resubscription, and immediately if already acknowledged.
    pub fn subscribed<F>(&self, callback: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let replay = self
            .client
            .registry()
            .on_subscribed(&self.name, self.generation, Arc::new(callback));
        run_deliveries(replay);
        self
    }

    /// Called with channel-scoped failures: rejected (re)authentication and
    /// `pusher:subscription_error` frames.
    pub fn error<F>(&self, callback: F) -> &Self
    where
        F: Fn(&RealtimeError) + Send + Sync + 'static,
    {
        self.client
            .registry()
            .on_error(&self.name, self.generation, Arc::new(callback));
        self
    }

    /// Send an ephemeral client event to the other members of the channel.
    ///
    /// At most once: there is no acknowledgment and no retry. `Queued` only
    /// means the frame reached the socket writer.
    pub async fn whisper(&self, event: &str, data: Value) -> Outbound {
        if self.client.registry().get(&self.name, self.generation).is_none() {
            debug!(channel = %self.name, "Whisper on a left channel dropped");
            return Outbound::Dropped;
        }
        let frame = Frame::new(client_event(event), data).on_channel(self.name.as_str());
        self.client.transport.send(frame).await
    }

    /// Unsubscribe and discard local state without waiting for the server.
    /// Only the first call has any effect.
    pub async fn leave(&self) {
        let removed = self.client.registry().remove(&self.name, self.generation);
        if removed {
            debug!(channel = %self.name, "Leaving channel");
            let _ = self
                .client
                .transport
                .send(Frame::unsubscribe(&self.name))
                .await;
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PresenceChannel
// ---------------------------------------------------------------------------

/// A presence channel: a [`Channel`] that also tracks its members.
#[derive(Clone, Debug)]
pub struct PresenceChannel {
    channel: Channel,
}

impl PresenceChannel {
    pub(crate) fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Called with the complete initial roster after `subscribed` has fired.
    /// If the roster was already delivered, called at once with the current
    /// members.
    pub fn here<F>(&self, callback: F) -> &Self
    where
        F: Fn(&[Member]) + Send + Sync + 'static,
    {
        let replay =
            self.client
                .registry()
                .on_here(&self.name, self.generation, Arc::new(callback));
        run_deliveries(replay);
        self
    }

    /// Called when another member joins. Never called for the local member.
    pub fn joining<F>(&self, callback: F) -> &Self
    where
        F: Fn(&Member) + Send + Sync + 'static,
    {
        self.client
            .registry()
            .on_joining(&self.name, self.generation, Arc::new(callback));
        self
    }

    /// Called when another member leaves. Never called for the local member.
    pub fn leaving<F>(&self, callback: F) -> &Self
    where
        F: Fn(&Member) + Send + Sync + 'static,
    {
        self.client
            .registry()
            .on_leaving(&self.name, self.generation, Arc::new(callback));
        self
    }

    /// The local member, as published by the authorizer.
    pub fn me(&self) -> Option<Member> {
        self.client
            .registry()
            .get(&self.name, self.generation)
            .and_then(|sub| sub.me.clone())
    }

    /// Current members in join order.
    pub fn members(&self) -> Vec<Member> {
        self.client
            .registry()
            .get(&self.name, self.generation)
            .map(|sub| sub.roster.members().to_vec())
            .unwrap_or_default()
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl Deref for PresenceChannel {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}
