//! Transport manager: the single socket shared by every channel.
//!
//! Owns the connection loop, issues `connect()` results once the server has
//! assigned a session id, reconnects on the backoff schedule after abnormal
//! closes, and publishes lifecycle events to any listener.

mod backoff;
mod connection;
mod types;

use std::sync::Arc;

use meshcall_common::{EventBus, SocketId};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use backoff::Backoff;
pub use types::{ConnectionState, Outbound, TransportEvent, ABNORMAL_CLOSURE, NORMAL_CLOSURE};

use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use crate::frame::Frame;
use connection::connection_loop;

/// A running connection loop.
struct Run {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub(crate) struct TransportInner {
    pub(crate) config: RealtimeConfig,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) events: EventBus<TransportEvent>,
    /// Writer queue of the live socket, if any.
    pub(crate) outbound: RwLock<Option<mpsc::UnboundedSender<Frame>>>,
    /// Channel-scoped frames for the registry, in socket order.
    pub(crate) inbound: mpsc::UnboundedSender<Frame>,
    run: Mutex<Option<Run>>,
}

/// Handle to the shared socket. Cloning is cheap; all clones drive the same
/// connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    /// Create an idle transport. Returns `(transport, inbound_frames)`; the
    /// receiver yields every channel-scoped frame in arrival order.
    pub fn new(config: RealtimeConfig) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Idle);
        let transport = Self {
            inner: Arc::new(TransportInner {
                config,
                state,
                events: EventBus::new(64),
                outbound: RwLock::new(None),
                inbound: inbound_tx,
                run: Mutex::new(None),
            }),
        };
        (transport, inbound_rx)
    }

    /// Resolve with the session id once the socket is open.
    ///
    /// Concurrent callers share the same attempt; during a backoff delay the
    /// scheduled attempt is reused rather than a new one started. Resolves
    /// immediately if already connected.
    pub async fn connect(&self) -> Result<SocketId, RealtimeError> {
        if let ConnectionState::Connected { socket_id } = &*self.inner.state.borrow() {
            return Ok(socket_id.clone());
        }

        self.ensure_running().await;

        let mut rx = self.inner.state.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                match &*state {
                    ConnectionState::Connected { socket_id } => return Ok(socket_id.clone()),
                    ConnectionState::PermanentlyDisconnected => {
                        return Err(RealtimeError::PermanentlyDisconnected)
                    }
                    ConnectionState::Closed => return Err(RealtimeError::Closed),
                    _ => {}
                }
            }
            rx.changed().await.map_err(|_| RealtimeError::Closed)?;
        }
    }

    /// Close the socket with a normal-closure code and stop reconnecting.
    /// Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let run = self.inner.run.lock().await.take();
        if let Some(run) = run {
            run.cancel.cancel();
            let _ = run.handle.await;
        }
        *self.inner.outbound.write().await = None;
        self.inner.state.send_if_modified(|state| {
            if matches!(state, ConnectionState::Idle | ConnectionState::Closed) {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        });
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    pub fn socket_id(&self) -> Option<SocketId> {
        match &*self.inner.state.borrow() {
            ConnectionState::Connected { socket_id } => Some(socket_id.clone()),
            _ => None,
        }
    }

    /// Queue a frame on the live socket.
    pub(crate) async fn send(&self, frame: Frame) -> Outbound {
        match &*self.inner.outbound.read().await {
            Some(tx) if tx.send(frame).is_ok() => Outbound::Queued,
            _ => {
                debug!("No live socket, frame dropped");
                Outbound::Dropped
            }
        }
    }

    async fn ensure_running(&self) {
        let mut run = self.inner.run.lock().await;
        if run.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        self.inner.state.send_replace(ConnectionState::Connecting);
        let handle = tokio::spawn(connection_loop(Arc::clone(&self.inner), cancel.clone()));
        *run = Some(Run { cancel, handle });
    }
}
