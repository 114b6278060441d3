//! Channel registry: subscription state per channel name and frame dispatch.
//!
//! The registry never runs callbacks itself. Every mutation returns the
//! deliveries it produced, and the caller runs them after releasing the
//! registry lock, so a callback may freely call back into the client.

use std::collections::HashMap;
use std::sync::Arc;

use meshcall_common::{PeerId, SocketId};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::RealtimeError;
use crate::frame::{events, Frame};
use crate::presence::{Member, Roster};

pub(crate) type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;
pub(crate) type SubscribedCallback = Arc<dyn Fn() + Send + Sync>;
pub(crate) type ErrorCallback = Arc<dyn Fn(&RealtimeError) + Send + Sync>;
pub(crate) type HereCallback = Arc<dyn Fn(&[Member]) + Send + Sync>;
pub(crate) type MemberCallback = Arc<dyn Fn(&Member) + Send + Sync>;

/// A callback invocation ready to run outside the lock.
pub(crate) type Delivery = Box<dyn FnOnce() + Send>;

/// Result of the running subscribe attempt; `None` until authentication
/// has finished and the subscribe frame was handed to the socket.
pub(crate) type Outcome = Option<Result<(), RealtimeError>>;

/// What kind of channel a subscription is; decides the wire prefix and
/// whether presence frames are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    /// Wire name for a caller-supplied channel name.
    pub fn wire_name(self, name: &str) -> String {
        let prefix = match self {
            Self::Public => return name.to_string(),
            Self::Private => "private-",
            Self::Presence => "presence-",
        };
        if name.starts_with(prefix) {
            name.to_string()
        } else {
            format!("{prefix}{name}")
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

pub(crate) struct Subscription {
    pub(crate) kind: ChannelKind,
    /// Distinguishes this subscription from a later one with the same name.
    pub(crate) generation: u64,
    /// Session the subscribe frame was last sent on.
    pub(crate) socket: Option<SocketId>,
    /// The server acknowledged the current subscribe frame.
    pub(crate) subscribed: bool,
    /// Authentication or the subscription itself was rejected; left alone
    /// until the caller joins again.
    pub(crate) failed: bool,
    attempt: watch::Sender<Outcome>,
    here_delivered: bool,
    pub(crate) me: Option<Member>,
    pub(crate) roster: Roster,
    listeners: HashMap<String, Vec<EventCallback>>,
    on_subscribed: Vec<SubscribedCallback>,
    on_error: Vec<ErrorCallback>,
    on_here: Vec<HereCallback>,
    on_joining: Vec<MemberCallback>,
    on_leaving: Vec<MemberCallback>,
}

impl Subscription {
    fn new(kind: ChannelKind, generation: u64) -> Self {
        Self {
            kind,
            generation,
            socket: None,
            subscribed: false,
            failed: false,
            attempt: watch::Sender::new(None),
            here_delivered: false,
            me: None,
            roster: Roster::default(),
            listeners: HashMap::new(),
            on_subscribed: Vec::new(),
            on_error: Vec::new(),
            on_here: Vec::new(),
            on_joining: Vec::new(),
            on_leaving: Vec::new(),
        }
    }

    fn is_me(&self, id: &PeerId) -> bool {
        self.me.as_ref().is_some_and(|me| &me.id == id)
    }

    /// Forget the acknowledged state ahead of a fresh subscribe frame.
    pub(crate) fn reset_for_resubscribe(&mut self, socket: SocketId) {
        self.socket = Some(socket);
        self.subscribed = false;
        self.failed = false;
        self.here_delivered = false;
        self.roster = Roster::default();
        self.attempt.send_replace(None);
    }

    /// Record that the subscribe frame went out. An outcome already
    /// recorded for this attempt is kept.
    pub(crate) fn attempt_sent(&self) {
        self.attempt.send_if_modified(|outcome| {
            if outcome.is_some() {
                return false;
            }
            *outcome = Some(Ok(()));
            true
        });
    }

    /// Mark the subscription rejected and wake anyone waiting on the attempt.
    pub(crate) fn reject(&mut self, error: &RealtimeError) -> Vec<Delivery> {
        self.failed = true;
        self.subscribed = false;
        self.attempt.send_replace(Some(Err(error.clone())));
        self.error_deliveries(error)
    }

    fn succeeded(&mut self, name: &str, payload: &Value) -> Vec<Delivery> {
        if self.subscribed {
            debug!(channel = %name, "Duplicate subscription acknowledgment ignored");
            return Vec::new();
        }
        self.subscribed = true;
        debug!(channel = %name, "Subscribed");

        let mut deliveries: Vec<Delivery> = self
            .on_subscribed
            .iter()
            .map(|cb| {
                let cb = Arc::clone(cb);
                Box::new(move || cb()) as Delivery
            })
            .collect();

        if self.kind == ChannelKind::Presence {
            self.roster = Roster::from_subscription(payload);
            self.here_delivered = true;
            let members: Arc<[Member]> = self.roster.members().into();
            deliveries.extend(self.on_here.iter().map(|cb| here_delivery(cb, &members)));
        }
        deliveries
    }

    fn member_added(&mut self, name: &str, payload: &Value) -> Vec<Delivery> {
        let Some(member) = Member::from_payload(payload) else {
            warn!(channel = %name, "member_added without user_id");
            return Vec::new();
        };
        if self.is_me(&member.id) {
            return Vec::new();
        }
        debug!(channel = %name, member = %member.id, "Member joined");
        self.roster.upsert(member.clone());
        let member = Arc::new(member);
        self.on_joining
            .iter()
            .map(|cb| member_delivery(cb, &member))
            .collect()
    }

    fn member_removed(&mut self, name: &str, payload: &Value) -> Vec<Delivery> {
        let Some(id) = payload.get("user_id").and_then(PeerId::from_json) else {
            warn!(channel = %name, "member_removed without user_id");
            return Vec::new();
        };
        if self.is_me(&id) {
            return Vec::new();
        }
        let member = self
            .roster
            .remove(&id)
            .unwrap_or_else(|| Member::new(id, Value::Null));
        debug!(channel = %name, member = %member.id, "Member left");
        let member = Arc::new(member);
        self.on_leaving
            .iter()
            .map(|cb| member_delivery(cb, &member))
            .collect()
    }

    fn error_deliveries(&self, error: &RealtimeError) -> Vec<Delivery> {
        self.on_error
            .iter()
            .map(|cb| {
                let cb = Arc::clone(cb);
                let error = error.clone();
                Box::new(move || cb(&error)) as Delivery
            })
            .collect()
    }

    fn event(&self, event: &str, payload: Value) -> Vec<Delivery> {
        let Some(callbacks) = self.listeners.get(event) else {
            return Vec::new();
        };
        let payload = Arc::new(payload);
        callbacks
            .iter()
            .map(|cb| {
                let cb = Arc::clone(cb);
                let payload = Arc::clone(&payload);
                Box::new(move || cb(&*payload)) as Delivery
            })
            .collect()
    }
}

fn here_delivery(cb: &HereCallback, members: &Arc<[Member]>) -> Delivery {
    let cb = Arc::clone(cb);
    let members = Arc::clone(members);
    Box::new(move || cb(&members[..]))
}

fn member_delivery(cb: &MemberCallback, member: &Arc<Member>) -> Delivery {
    let cb = Arc::clone(cb);
    let member = Arc::clone(member);
    Box::new(move || cb(&*member))
}

/// Map a `pusher:subscription_error` payload onto an error value.
fn subscription_error(channel: &str, payload: &Value) -> RealtimeError {
    let status = payload
        .get("status")
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok());
    match status {
        Some(status) => RealtimeError::AuthRejected {
            channel: channel.to_string(),
            status,
        },
        None => RealtimeError::Protocol(
            payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("subscription failed")
                .to_string(),
        ),
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Outcome of looking a channel up for a new `join`/`private`/`presence` call.
pub(crate) enum Claim {
    /// Already claimed on the current session; nothing to send. `attempt`
    /// resolves once the claiming call has authenticated or failed.
    Existing {
        generation: u64,
        attempt: watch::Receiver<Outcome>,
    },
    /// Needs authentication and a subscribe frame on `socket`.
    Subscribe { generation: u64, created: bool },
}

#[derive(Default)]
pub(crate) struct Registry {
    channels: HashMap<String, Subscription>,
    next_generation: u64,
}

impl Registry {
    /// Register `name` (or reuse its subscription) for a subscribe on `socket`.
    pub(crate) fn claim(&mut self, name: &str, kind: ChannelKind, socket: &SocketId) -> Claim {
        if let Some(sub) = self.channels.get_mut(name) {
            if !sub.failed && sub.socket.as_ref() == Some(socket) {
                return Claim::Existing {
                    generation: sub.generation,
                    attempt: sub.attempt.subscribe(),
                };
            }
            sub.reset_for_resubscribe(socket.clone());
            return Claim::Subscribe {
                generation: sub.generation,
                created: false,
            };
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let mut sub = Subscription::new(kind, generation);
        sub.socket = Some(socket.clone());
        self.channels.insert(name.to_string(), sub);
        Claim::Subscribe {
            generation,
            created: true,
        }
    }

    /// The live subscription for `name`, if it is still the given generation.
    pub(crate) fn get_mut(&mut self, name: &str, generation: u64) -> Option<&mut Subscription> {
        self.channels
            .get_mut(name)
            .filter(|sub| sub.generation == generation)
    }

    pub(crate) fn get(&self, name: &str, generation: u64) -> Option<&Subscription> {
        self.channels
            .get(name)
            .filter(|sub| sub.generation == generation)
    }

    /// Drop the subscription. Returns `false` if it was already gone.
    pub(crate) fn remove(&mut self, name: &str, generation: u64) -> bool {
        if self.get(name, generation).is_none() {
            return false;
        }
        self.channels.remove(name);
        true
    }

    /// Subscriptions not yet sent on `socket`, marked as sent on it. Failed
    /// subscriptions are skipped.
    pub(crate) fn take_stale(&mut self, socket: &SocketId) -> Vec<(String, ChannelKind, u64)> {
        self.channels
            .iter_mut()
            .filter(|(_, sub)| !sub.failed && sub.socket.as_ref() != Some(socket))
            .map(|(name, sub)| {
                sub.reset_for_resubscribe(socket.clone());
                (name.clone(), sub.kind, sub.generation)
            })
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.channels.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.channels.len()
    }

    #[cfg(test)]
    pub(crate) fn is_failed(&self, name: &str) -> bool {
        self.channels.get(name).is_some_and(|sub| sub.failed)
    }

    // -- listener registration -------------------------------------------

    pub(crate) fn listen(&mut self, name: &str, generation: u64, event: &str, cb: EventCallback) {
        if let Some(sub) = self.get_mut(name, generation) {
            sub.listeners.entry(event.to_string()).or_default().push(cb);
        }
    }

    /// Attach a `subscribed` callback; replayed at once if already subscribed.
    pub(crate) fn on_subscribed(
        &mut self,
        name: &str,
        generation: u64,
        cb: SubscribedCallback,
    ) -> Option<Delivery> {
        let sub = self.get_mut(name, generation)?;
        sub.on_subscribed.push(Arc::clone(&cb));
        sub.subscribed.then(|| Box::new(move || cb()) as Delivery)
    }

    pub(crate) fn on_error(&mut self, name: &str, generation: u64, cb: ErrorCallback) {
        if let Some(sub) = self.get_mut(name, generation) {
            sub.on_error.push(cb);
        }
    }

    /// Attach a `here` callback; replays the current roster if the initial
    /// roster was already delivered.
    pub(crate) fn on_here(
        &mut self,
        name: &str,
        generation: u64,
        cb: HereCallback,
    ) -> Option<Delivery> {
        let sub = self.get_mut(name, generation)?;
        sub.on_here.push(Arc::clone(&cb));
        if !sub.here_delivered {
            return None;
        }
        let members: Arc<[Member]> = sub.roster.members().into();
        Some(here_delivery(&cb, &members))
    }

    pub(crate) fn on_joining(&mut self, name: &str, generation: u64, cb: MemberCallback) {
        if let Some(sub) = self.get_mut(name, generation) {
            sub.on_joining.push(cb);
        }
    }

    pub(crate) fn on_leaving(&mut self, name: &str, generation: u64, cb: MemberCallback) {
        if let Some(sub) = self.get_mut(name, generation) {
            sub.on_leaving.push(cb);
        }
    }

    // -- dispatch -----------------------------------------------------------

    /// Route one inbound frame to the subscription with the exact same name.
    pub(crate) fn dispatch(&mut self, frame: &Frame) -> Vec<Delivery> {
        let Some(name) = frame.channel.as_deref() else {
            debug!(event = %frame.event, "Frame without channel ignored");
            return Vec::new();
        };
        let Some(sub) = self.channels.get_mut(name) else {
            debug!(channel = %name, event = %frame.event, "Frame for unknown channel ignored");
            return Vec::new();
        };

        let payload = frame.payload();
        let presence = sub.kind == ChannelKind::Presence;
        match frame.event.as_str() {
            events::SUBSCRIPTION_SUCCEEDED => sub.succeeded(name, &payload),
            events::SUBSCRIPTION_ERROR => {
                let error = subscription_error(name, &payload);
                warn!(channel = %name, error = %error, "Subscription rejected by server");
                sub.reject(&error)
            }
            events::MEMBER_ADDED if presence => sub.member_added(name, &payload),
            events::MEMBER_REMOVED if presence => sub.member_removed(name, &payload),
            event => sub.event(event, payload),
        }
    }
}
