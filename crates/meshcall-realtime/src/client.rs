//! The realtime client: one shared socket, many channels.
//!
//! `RealtimeClient` is the process-scoped service object. Create it with
//! [`RealtimeClient::init`], hand clones to whoever needs channels, and call
//! [`RealtimeClient::shutdown`] on logout.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use meshcall_common::SocketId;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::auth::{Authorizer, Credential, HttpAuthorizer};
use crate::channel::{Channel, PresenceChannel};
use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use crate::frame::Frame;
use crate::presence::Member;
use crate::registry::{ChannelKind, Claim, Delivery, Registry};
use crate::transport::{ConnectionState, Transport, TransportEvent};

pub(crate) struct ClientInner {
    pub(crate) transport: Transport,
    registry: Mutex<Registry>,
    authorizer: Arc<dyn Authorizer>,
    credential: Credential,
}

impl ClientInner {
    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Authenticate `name` for `socket_id` and send its subscribe frame.
    async fn authenticate_and_subscribe(
        &self,
        name: &str,
        generation: u64,
        socket_id: &SocketId,
    ) -> Result<(), RealtimeError> {
        let credential = self.credential.current();
        let auth = self
            .authorizer
            .authorize(name, socket_id, &credential)
            .await?;

        let me = auth
            .channel_data
            .as_deref()
            .and_then(Member::from_channel_data);
        {
            let mut registry = self.registry();
            let Some(sub) = registry.get_mut(name, generation) else {
                debug!(channel = %name, "Channel left during authentication");
                return Err(RealtimeError::Closed);
            };
            if sub.kind == ChannelKind::Presence {
                if me.is_none() {
                    return Err(RealtimeError::Auth(
                        "presence authorization without channel_data".into(),
                    ));
                }
                sub.me = me;
            }
        }

        let frame = Frame::subscribe(name, Some(&auth.auth), auth.channel_data.as_deref());
        if !self.transport.send(frame).await.is_queued() {
            // Resent with the next session id.
            debug!(channel = %name, "Socket gone before subscribe was sent");
        }
        if let Some(sub) = self.registry().get(name, generation) {
            sub.attempt_sent();
        }
        Ok(())
    }

    /// Report a failed (re)authentication to the channel's error listeners.
    /// A subscription created by the failed call is removed again.
    fn fail_subscription(&self, name: &str, generation: u64, error: &RealtimeError, remove: bool) {
        let deliveries = {
            let mut registry = self.registry();
            let deliveries = registry
                .get_mut(name, generation)
                .map(|sub| sub.reject(error))
                .unwrap_or_default();
            if remove {
                registry.remove(name, generation);
            }
            deliveries
        };
        run_deliveries(deliveries);
    }
}

/// Fails a subscribe attempt whose call was dropped before authentication
/// finished, so callers sharing the claim are not left waiting.
struct AttemptGuard<'a> {
    inner: &'a ClientInner,
    name: &'a str,
    generation: u64,
    created: bool,
    finished: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(channel = %self.name, "Subscribe call dropped during authentication");
            self.inner
                .fail_subscription(self.name, self.generation, &RealtimeError::Closed, self.created);
        }
    }
}

pub(crate) fn run_deliveries(deliveries: impl IntoIterator<Item = Delivery>) {
    for delivery in deliveries {
        delivery();
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Handle to the realtime service. Cloning is cheap; all clones share the
/// socket, the channel registry and the credential.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

impl RealtimeClient {
    /// Create the client with the HTTP authorizer from `config`. Nothing is
    /// connected until the first `connect()` or channel call.
    ///
    /// Must be called from within a tokio runtime.
    pub fn init(config: RealtimeConfig, credential: impl Into<String>) -> Result<Self, RealtimeError> {
        let authorizer = HttpAuthorizer::new(config.auth_endpoint.clone())?;
        Ok(Self::with_authorizer(
            config,
            Credential::new(credential),
            Arc::new(authorizer),
        ))
    }

    /// Create the client with a custom authorizer.
    pub fn with_authorizer(
        config: RealtimeConfig,
        credential: Credential,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        let (transport, inbound) = Transport::new(config);
        let lifecycle = transport.subscribe();
        let inner = Arc::new(ClientInner {
            transport,
            registry: Mutex::new(Registry::default()),
            authorizer,
            credential,
        });
        tokio::spawn(dispatch_loop(Arc::downgrade(&inner), inbound, lifecycle));
        Self { inner }
    }

    /// Resolve with the session id once the socket is open. Concurrent calls
    /// share one attempt.
    pub async fn connect(&self) -> Result<SocketId, RealtimeError> {
        self.inner.transport.connect().await
    }

    /// Subscribe to a public channel.
    pub async fn join(&self, name: &str) -> Result<Channel, RealtimeError> {
        self.subscribe(name, ChannelKind::Public).await
    }

    /// Subscribe to `private-{name}`.
    pub async fn private(&self, name: &str) -> Result<Channel, RealtimeError> {
        self.subscribe(name, ChannelKind::Private).await
    }

    /// Subscribe to `presence-{name}`.
    pub async fn presence(&self, name: &str) -> Result<PresenceChannel, RealtimeError> {
        self.subscribe(name, ChannelKind::Presence)
            .await
            .map(PresenceChannel::new)
    }

    /// Replace the bearer credential. Live subscriptions are untouched; the
    /// next authentication uses the new value.
    pub fn set_credential(&self, token: impl Into<String>) {
        self.inner.credential.set(token);
        debug!("Credential replaced");
    }

    /// Subscribe to transport lifecycle events.
    pub fn lifecycle(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.transport.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.transport.watch_state()
    }

    pub fn socket_id(&self) -> Option<SocketId> {
        self.inner.transport.socket_id()
    }

    /// Number of channels currently registered.
    pub fn channel_count(&self) -> usize {
        self.inner.registry().len()
    }

    /// Close the socket normally and release every channel. No reconnection
    /// follows. Safe to call more than once.
    pub async fn disconnect(&self) {
        self.inner.transport.disconnect().await;
        self.inner.registry().clear();
        info!("Realtime client disconnected");
    }

    /// End of the service lifetime.
    pub async fn shutdown(self) {
        self.disconnect().await;
    }

    async fn subscribe(&self, name: &str, kind: ChannelKind) -> Result<Channel, RealtimeError> {
        let wire = kind.wire_name(name);
        let socket_id = self.inner.transport.connect().await?;

        let claim = self.inner.registry().claim(&wire, kind, &socket_id);
        let (generation, created) = match claim {
            Claim::Existing {
                generation,
                mut attempt,
            } => {
                // Share the outcome of the call that is already subscribing.
                let outcome = attempt
                    .wait_for(Option::is_some)
                    .await
                    .map(|outcome| (*outcome).clone());
                return match outcome {
                    Ok(Some(Err(e))) => Err(e),
                    Ok(_) => Ok(Channel::new(Arc::clone(&self.inner), wire, kind, generation)),
                    Err(_) => Err(RealtimeError::Closed),
                };
            }
            Claim::Subscribe {
                generation,
                created,
            } => (generation, created),
        };

        info!(channel = %wire, "Subscribing");
        let mut guard = AttemptGuard {
            inner: &self.inner,
            name: &wire,
            generation,
            created,
            finished: false,
        };
        let result = self
            .inner
            .authenticate_and_subscribe(&wire, generation, &socket_id)
            .await;
        guard.finished = true;
        drop(guard);
        if let Err(e) = result {
            warn!(channel = %wire, error = %e, "Subscription failed");
            self.inner.fail_subscription(&wire, generation, &e, created);
            return Err(e);
        }
        Ok(Channel::new(Arc::clone(&self.inner), wire, kind, generation))
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("state", &self.inner.transport.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Route inbound frames to the registry in socket order, and resubscribe
/// every channel whenever a new session replaces a lost one.
async fn dispatch_loop(
    inner: Weak<ClientInner>,
    mut inbound: mpsc::UnboundedReceiver<Frame>,
    mut lifecycle: broadcast::Receiver<TransportEvent>,
) {
    let mut connected_before = false;
    loop {
        tokio::select! {
            frame = inbound.recv() => {
                let Some(frame) = frame else { break };
                let Some(inner) = inner.upgrade() else { break };
                let deliveries = inner.registry().dispatch(&frame);
                run_deliveries(deliveries);
            }
            event = lifecycle.recv() => match event {
                Ok(TransportEvent::Connected { socket_id }) => {
                    if connected_before {
                        let Some(inner) = inner.upgrade() else { break };
                        tokio::spawn(resubscribe_all(inner, socket_id));
                    }
                    connected_before = true;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Lifecycle receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("Dispatcher stopped");
}

async fn resubscribe_all(inner: Arc<ClientInner>, socket_id: SocketId) {
    let stale = inner.registry().take_stale(&socket_id);
    for (name, _, generation) in stale {
        info!(channel = %name, "Resubscribing after reconnect");
        if let Err(e) = inner
            .authenticate_and_subscribe(&name, generation, &socket_id)
            .await
        {
            warn!(channel = %name, error = %e, "Resubscription failed");
            inner.fail_subscription(&name, generation, &e, false);
        }
    }
}
