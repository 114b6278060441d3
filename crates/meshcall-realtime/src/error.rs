#[derive(Debug, Clone, thiserror::Error)]
pub enum RealtimeError {
    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,

    #[error("permanently disconnected after exhausting reconnect attempts")]
    PermanentlyDisconnected,

    #[error("connection timed out after {0}s")]
    ConnectTimeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("subscription to {channel} rejected with HTTP {status}")]
    AuthRejected { channel: String, status: u16 },

    #[error("auth error: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}
