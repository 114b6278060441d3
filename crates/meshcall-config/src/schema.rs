//! Configuration schema types.
//!
//! All structs use `serde(default)` so partial configs work correctly.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshcallConfig {
    pub realtime: RealtimeSection,
    pub room: RoomSection,
    pub logging: LoggingConfig,
}

/// Connection to the realtime channel server.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSection {
    /// Base WebSocket URL, e.g. `wss://ws.example.com`.
    pub host: String,
    /// Application key, appended as `/app/{app_key}`.
    pub app_key: String,
    /// HTTP endpoint that signs channel subscriptions.
    pub auth_endpoint: String,
    /// Bearer credential used when no token is passed on the command line.
    pub token: Option<String>,
    /// Seconds between liveness pings.
    pub heartbeat_interval: u32,
    /// Seconds to wait for the socket to open.
    pub connect_timeout: u32,
    /// First reconnect delay in milliseconds; doubled on every attempt.
    pub reconnect_base_ms: u32,
    /// Attempts before the client reports itself permanently disconnected.
    pub max_reconnect_attempts: u32,
}

impl std::fmt::Debug for RealtimeSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSection")
            .field("host", &self.host)
            .field("app_key", &self.app_key)
            .field("auth_endpoint", &self.auth_endpoint)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("reconnect_base_ms", &self.reconnect_base_ms)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .finish()
    }
}

impl Default for RealtimeSection {
    fn default() -> Self {
        Self {
            host: "wss://ws.meshcall.dev".into(),
            app_key: String::new(),
            auth_endpoint: "https://api.meshcall.dev/broadcasting/auth".into(),
            token: None,
            heartbeat_interval: 30,
            connect_timeout: 15,
            reconnect_base_ms: 1000,
            max_reconnect_attempts: 5,
        }
    }
}

/// Defaults applied when joining a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomSection {
    pub start_with_camera: bool,
    pub start_with_mic: bool,
    /// Whisper event carrying signaling envelopes (sent as `client-{name}`).
    pub signal_event: String,
}

impl Default for RoomSection {
    fn default() -> Self {
        Self {
            start_with_camera: true,
            start_with_mic: true,
            signal_event: "signal".into(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
}
