//! Background WebSocket connection loop with backoff reconnection.

use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use meshcall_common::SocketId;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message as WsMessage, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::types::{ConnectionState, TransportEvent, ABNORMAL_CLOSURE, NORMAL_CLOSURE};
use super::TransportInner;
use crate::error::RealtimeError;
use crate::frame::{events, Frame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, WsMessage>;

/// How a single socket session ended.
enum SessionEnd {
    /// `disconnect()` was called.
    Shutdown,
    /// The socket closed or failed underneath us.
    Closed { code: u16, reason: String },
}

// ---------------------------------------------------------------------------
// Connection Loop
// ---------------------------------------------------------------------------

/// Connect, run the session, and on loss retry on the backoff schedule until
/// cancelled, closed normally, or out of attempts.
pub(crate) async fn connection_loop(inner: Arc<TransportInner>, cancel: CancellationToken) {
    let mut backoff = Backoff::new(
        inner.config.reconnect_base,
        inner.config.max_reconnect_attempts,
    );
    let url = inner.config.ws_url();
    let timeout = inner.config.connect_timeout;

    loop {
        inner.state.send_replace(ConnectionState::Connecting);
        info!(url = %url.split('?').next().unwrap_or(""), "Connecting to channel server");

        let attempt = tokio::select! {
            _ = cancel.cancelled() => {
                inner.state.send_replace(ConnectionState::Closed);
                return;
            }
            result = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str())) => result,
        };

        match attempt {
            Ok(Ok((ws_stream, _))) => match run_session(&inner, ws_stream, &cancel, &mut backoff).await {
                SessionEnd::Shutdown => {
                    info!("Disconnected by client");
                    inner.state.send_replace(ConnectionState::Closed);
                    inner.events.publish(TransportEvent::Disconnected {
                        code: NORMAL_CLOSURE,
                        reason: "client disconnect".into(),
                    });
                    return;
                }
                SessionEnd::Closed { code, reason } if code == NORMAL_CLOSURE => {
                    info!(reason = %reason, "Server closed the connection normally");
                    inner.state.send_replace(ConnectionState::Closed);
                    inner
                        .events
                        .publish(TransportEvent::Disconnected { code, reason });
                    return;
                }
                SessionEnd::Closed { code, reason } => {
                    warn!(code, reason = %reason, "Connection lost");
                    inner
                        .events
                        .publish(TransportEvent::Disconnected { code, reason });
                }
            },
            Ok(Err(e)) => {
                error!(error = %e, "Failed to connect to channel server");
                inner
                    .events
                    .publish(TransportEvent::Error(format!("connection failed: {e}")));
            }
            Err(_elapsed) => {
                let err = RealtimeError::ConnectTimeout(timeout.as_secs());
                error!("{err}");
                inner.events.publish(TransportEvent::Error(err.to_string()));
            }
        }

        let Some(delay) = backoff.next_delay() else {
            error!(
                attempts = backoff.attempts(),
                "Reconnect attempts exhausted, giving up"
            );
            inner
                .state
                .send_replace(ConnectionState::PermanentlyDisconnected);
            inner.events.publish(TransportEvent::PermanentlyDisconnected);
            return;
        };

        let attempt = backoff.attempts();
        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting after backoff"
        );
        inner
            .state
            .send_replace(ConnectionState::Reconnecting { attempt, delay });
        inner
            .events
            .publish(TransportEvent::Reconnecting { attempt, delay });

        tokio::select! {
            _ = cancel.cancelled() => {
                inner.state.send_replace(ConnectionState::Closed);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Drive one open socket: write queued frames, answer pings, send heartbeats,
/// and route inbound frames until the socket ends or we are cancelled.
async fn run_session(
    inner: &Arc<TransportInner>,
    ws_stream: WsStream,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
) -> SessionEnd {
    let (mut write, mut read) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    *inner.outbound.write().await = Some(out_tx);

    let period = inner.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    let end = match send_frame(&mut write, &Frame::ping()).await {
        Err(reason) => SessionEnd::Closed {
            code: ABNORMAL_CLOSURE,
            reason,
        },
        Ok(()) => loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let close = CloseFrame {
                        code: CloseCode::Normal,
                        reason: Utf8Bytes::from_static("client disconnect"),
                    };
                    let _ = write.send(WsMessage::Close(Some(close))).await;
                    let _ = write.close().await;
                    break SessionEnd::Shutdown;
                }
                Some(frame) = out_rx.recv() => {
                    if let Err(reason) = send_frame(&mut write, &frame).await {
                        break SessionEnd::Closed { code: ABNORMAL_CLOSURE, reason };
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(reason) = send_frame(&mut write, &Frame::ping()).await {
                        break SessionEnd::Closed { code: ABNORMAL_CLOSURE, reason };
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let frame = match Frame::parse(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                debug!(error = %e, "Unrecognized frame from channel server");
                                continue;
                            }
                        };
                        if let Err(reason) = handle_frame(inner, frame, backoff, &mut write).await {
                            break SessionEnd::Closed { code: ABNORMAL_CLOSURE, reason };
                        }
                    }
                    Some(Ok(WsMessage::Close(close))) => {
                        let (code, reason) = close
                            .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                            .unwrap_or((ABNORMAL_CLOSURE, "closed without status".to_string()));
                        break SessionEnd::Closed { code, reason };
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        inner.events.publish(TransportEvent::Error(e.to_string()));
                        break SessionEnd::Closed { code: ABNORMAL_CLOSURE, reason: e.to_string() };
                    }
                    None => {
                        break SessionEnd::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: "stream ended".into(),
                        };
                    }
                    _ => {}
                },
            }
        },
    };

    *inner.outbound.write().await = None;
    end
}

/// Handle transport-level frames; everything else goes to the channel registry.
async fn handle_frame(
    inner: &Arc<TransportInner>,
    frame: Frame,
    backoff: &mut Backoff,
    write: &mut WsWrite,
) -> Result<(), String> {
    match frame.event.as_str() {
        events::CONNECTION_ESTABLISHED => {
            let payload = frame.payload();
            match payload.get("socket_id").and_then(Value::as_str) {
                Some(id) => {
                    let socket_id = SocketId::new(id);
                    backoff.reset();
                    info!(socket_id = %socket_id, "Connected to channel server");
                    inner.state.send_replace(ConnectionState::Connected {
                        socket_id: socket_id.clone(),
                    });
                    inner.events.publish(TransportEvent::Connected { socket_id });
                }
                None => warn!("connection_established frame without socket_id"),
            }
        }
        events::PING => send_frame(write, &Frame::pong()).await?,
        events::PONG => debug!("pong"),
        events::ERROR => {
            let payload = frame.payload();
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown server error")
                .to_string();
            warn!(code = ?payload.get("code"), message = %message, "Server error");
            inner.events.publish(TransportEvent::Error(message));
        }
        _ => {
            // The receiver is gone only once the client itself was dropped.
            let _ = inner.inbound.send(frame);
        }
    }
    Ok(())
}

async fn send_frame(write: &mut WsWrite, frame: &Frame) -> Result<(), String> {
    let json = frame.to_json().map_err(|e| e.to_string())?;
    write
        .send(WsMessage::Text(json.into()))
        .await
        .map_err(|e| e.to_string())
}
