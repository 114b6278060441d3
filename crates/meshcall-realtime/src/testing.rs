//! In-process Pusher-protocol server and a static authorizer for tests.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use meshcall_common::SocketId;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message as WsMessage, Utf8Bytes};

use crate::auth::{Authorizer, ChannelAuth};
use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use crate::frame::{events, Frame};

/// Poll `condition` until it holds or `timeout` passes.
pub(crate) async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Client config pointing at `addr` with fast reconnects.
pub(crate) fn test_config(addr: SocketAddr) -> RealtimeConfig {
    RealtimeConfig {
        host: format!("ws://{addr}"),
        app_key: "test-key".into(),
        auth_endpoint: "http://127.0.0.1:9/auth".into(),
        heartbeat_interval: Duration::from_secs(30),
        connect_timeout: Duration::from_secs(2),
        reconnect_base: Duration::from_millis(20),
        max_reconnect_attempts: 5,
    }
}

// ---------------------------------------------------------------------------
// Fake server
// ---------------------------------------------------------------------------

struct Connection {
    tx: mpsc::UnboundedSender<WsMessage>,
    /// Subscribed channel -> presence member `(user_id, user_info)`.
    channels: HashMap<String, Option<(Value, Value)>>,
}

#[derive(Default)]
struct ServerState {
    connections: HashMap<u64, Connection>,
    /// Every frame received, with the connection it came from.
    received: Vec<(u64, Frame)>,
    /// Channels whose subscribe is answered with `pusher:subscription_error`.
    refused: HashSet<String>,
}

struct Shared {
    state: Mutex<ServerState>,
    accepted: AtomicUsize,
    kill: broadcast::Sender<()>,
}

/// A minimal channel server: connection handshake, subscribe/unsubscribe,
/// presence rosters, member added/removed, whisper relay and ping/pong.
pub(crate) struct FakeServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl FakeServer {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake server");
        let addr = listener.local_addr().expect("local addr");
        let (kill, _) = broadcast::channel(4);
        let shared = Arc::new(Shared {
            state: Mutex::new(ServerState::default()),
            accepted: AtomicUsize::new(0),
            kill,
        });

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let id = accept_shared.accepted.fetch_add(1, Ordering::SeqCst) as u64 + 1;
                tokio::spawn(serve(stream, id, Arc::clone(&accept_shared)));
            }
        });

        Self { addr, shared }
    }

    pub(crate) fn config(&self) -> RealtimeConfig {
        test_config(self.addr)
    }

    /// Connections accepted so far.
    pub(crate) fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Frames received with the given event name, in arrival order.
    pub(crate) fn received(&self, event: &str) -> Vec<Frame> {
        self.shared
            .state
            .lock()
            .unwrap()
            .received
            .iter()
            .filter(|(_, f)| f.event == event)
            .map(|(_, f)| f.clone())
            .collect()
    }

    /// Subscribe frames received for `channel`.
    pub(crate) fn subscribes_to(&self, channel: &str) -> usize {
        self.received(events::SUBSCRIBE)
            .iter()
            .filter(|f| f.data["channel"] == channel)
            .count()
    }

    /// Answer later subscribes to `channel` with a 403 subscription error.
    pub(crate) fn refuse(&self, channel: &str) {
        self.shared.state.lock().unwrap().refused.insert(channel.to_string());
    }

    pub(crate) fn admit(&self, channel: &str) {
        self.shared.state.lock().unwrap().refused.remove(channel);
    }

    /// Drop every connection without a close frame (abnormal closure).
    pub(crate) fn kill_connections(&self) {
        let _ = self.shared.kill.send(());
    }

    /// Close every connection with a close frame carrying `code`.
    pub(crate) fn close_connections(&self, code: u16) {
        let state = self.shared.state.lock().unwrap();
        for conn in state.connections.values() {
            let _ = conn.tx.send(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: Utf8Bytes::from_static("server close"),
            })));
        }
    }
}

async fn serve(stream: TcpStream, id: u64, shared: Arc<Shared>) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut kill = shared.kill.subscribe();

    shared.state.lock().unwrap().connections.insert(
        id,
        Connection {
            tx: tx.clone(),
            channels: HashMap::new(),
        },
    );

    let established = json!({"socket_id": format!("4242.{id}"), "activity_timeout": 120});
    let _ = tx.send(text(&Frame::new(
        events::CONNECTION_ESTABLISHED,
        Value::String(established.to_string()),
    )));

    loop {
        tokio::select! {
            Some(msg) = rx.recv() => {
                let closing = matches!(msg, WsMessage::Close(_));
                if write.send(msg).await.is_err() || closing {
                    break;
                }
            }
            _ = kill.recv() => break,
            msg = read.next() => match msg {
                Some(Ok(WsMessage::Text(body))) => {
                    if let Ok(frame) = Frame::parse(&body) {
                        handle(&shared, id, frame);
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
        }
    }

    disconnect(&shared, id);
}

fn text(frame: &Frame) -> WsMessage {
    WsMessage::Text(frame.to_json().unwrap_or_default().into())
}

fn handle(shared: &Shared, id: u64, frame: Frame) {
    let mut state = shared.state.lock().unwrap();
    state.received.push((id, frame.clone()));

    match frame.event.as_str() {
        events::PING => send_to(&state, id, &Frame::pong()),
        events::SUBSCRIBE => {
            let channel = frame.data["channel"].as_str().unwrap_or_default().to_string();
            if state.refused.contains(&channel) {
                let error = json!({"type": "AuthError", "error": "forbidden", "status": 403});
                let refusal = Frame::new(events::SUBSCRIPTION_ERROR, Value::String(error.to_string()))
                    .on_channel(channel.as_str());
                send_to(&state, id, &refusal);
                return;
            }
            let member = frame.data["channel_data"]
                .as_str()
                .and_then(|s| serde_json::from_str::<Value>(s).ok())
                .map(|v| (v["user_id"].clone(), v["user_info"].clone()));
            subscribe(&mut state, id, channel, member);
        }
        events::UNSUBSCRIBE => {
            let channel = frame.data["channel"].as_str().unwrap_or_default().to_string();
            unsubscribe(&mut state, id, &channel);
        }
        event if event.starts_with(events::CLIENT_PREFIX) => {
            let Some(channel) = frame.channel.clone() else {
                return;
            };
            let relay = Frame::new(frame.event.clone(), frame.data.clone()).on_channel(channel.as_str());
            for (other, conn) in &state.connections {
                if *other != id && conn.channels.contains_key(&channel) {
                    let _ = conn.tx.send(text(&relay));
                }
            }
        }
        _ => {}
    }
}

fn send_to(state: &ServerState, id: u64, frame: &Frame) {
    if let Some(conn) = state.connections.get(&id) {
        let _ = conn.tx.send(text(frame));
    }
}

/// Members of `channel` in connection order, one entry per user id.
fn roster(state: &ServerState, channel: &str) -> Vec<(Value, Value)> {
    let mut ids: Vec<_> = state.connections.keys().copied().collect();
    ids.sort_unstable();
    let mut members: Vec<(Value, Value)> = Vec::new();
    for id in ids {
        if let Some(Some(member)) = state.connections[&id].channels.get(channel) {
            if !members.iter().any(|(uid, _)| uid == &member.0) {
                members.push(member.clone());
            }
        }
    }
    members
}

fn user_present_elsewhere(state: &ServerState, id: u64, channel: &str, user_id: &Value) -> bool {
    state.connections.iter().any(|(other, conn)| {
        *other != id
            && matches!(conn.channels.get(channel), Some(Some((uid, _))) if uid == user_id)
    })
}

fn broadcast_except(state: &ServerState, id: u64, channel: &str, frame: &Frame) {
    for (other, conn) in &state.connections {
        if *other != id && conn.channels.contains_key(channel) {
            let _ = conn.tx.send(text(frame));
        }
    }
}

fn subscribe(state: &mut ServerState, id: u64, channel: String, member: Option<(Value, Value)>) {
    let Some(conn) = state.connections.get_mut(&id) else {
        return;
    };
    conn.channels.insert(channel.clone(), member.clone());

    let data = match &member {
        Some((user_id, user_info)) => {
            let members = roster(state, &channel);
            let ids: Vec<Value> = members.iter().map(|(uid, _)| uid.clone()).collect();
            let hash: serde_json::Map<String, Value> = members
                .iter()
                .map(|(uid, info)| (id_key(uid), info.clone()))
                .collect();

            if !user_present_elsewhere(state, id, &channel, user_id) {
                let added = Frame::new(
                    events::MEMBER_ADDED,
                    Value::String(json!({"user_id": user_id, "user_info": user_info}).to_string()),
                )
                .on_channel(channel.as_str());
                broadcast_except(state, id, &channel, &added);
            }
            json!({"presence": {"ids": ids, "hash": hash, "count": members.len()}})
        }
        None => json!({}),
    };

    let succeeded = Frame::new(events::SUBSCRIPTION_SUCCEEDED, Value::String(data.to_string()))
        .on_channel(channel.as_str());
    send_to(state, id, &succeeded);
}

fn unsubscribe(state: &mut ServerState, id: u64, channel: &str) {
    let Some(member) = state
        .connections
        .get_mut(&id)
        .and_then(|conn| conn.channels.remove(channel))
    else {
        return;
    };
    if let Some((user_id, _)) = member {
        if !user_present_elsewhere(state, id, channel, &user_id) {
            let removed = Frame::new(
                events::MEMBER_REMOVED,
                Value::String(json!({ "user_id": user_id }).to_string()),
            )
            .on_channel(channel);
            broadcast_except(state, id, channel, &removed);
        }
    }
}

fn disconnect(shared: &Shared, id: u64) {
    let mut state = shared.state.lock().unwrap();
    let channels: Vec<String> = state
        .connections
        .get(&id)
        .map(|conn| conn.channels.keys().cloned().collect())
        .unwrap_or_default();
    for channel in channels {
        unsubscribe(&mut state, id, &channel);
    }
    state.connections.remove(&id);
}

fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Static authorizer
// ---------------------------------------------------------------------------

/// Signs everything locally; presence channels publish `user_id`.
pub(crate) struct StaticAuthorizer {
    user_id: String,
    reject_with: Option<u16>,
    delay: Option<Duration>,
    seen: Mutex<Vec<(String, String)>>,
}

impl StaticAuthorizer {
    pub(crate) fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            reject_with: None,
            delay: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn rejecting(status: u16) -> Self {
        Self {
            reject_with: Some(status),
            ..Self::new("0")
        }
    }

    /// Answer every request only after `delay`.
    pub(crate) fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// `(channel, credential)` pairs seen so far.
    pub(crate) fn seen(&self) -> Vec<(String, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(
        &self,
        channel: &str,
        socket_id: &SocketId,
        credential: &str,
    ) -> Result<ChannelAuth, RealtimeError> {
        self.seen
            .lock()
            .unwrap()
            .push((channel.to_string(), credential.to_string()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = self.reject_with {
            return Err(RealtimeError::AuthRejected {
                channel: channel.to_string(),
                status,
            });
        }
        let channel_data = channel.starts_with("presence-").then(|| {
            json!({
                "user_id": self.user_id,
                "user_info": {"name": format!("user {}", self.user_id)}
            })
            .to_string()
        });
        Ok(ChannelAuth {
            auth: format!("test-key:{socket_id}:{channel}"),
            channel_data,
        })
    }
}
