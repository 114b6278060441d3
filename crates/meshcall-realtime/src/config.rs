//! Runtime configuration for the realtime client.

use std::time::Duration;

/// Configuration for connecting to a Pusher-protocol channel server.
#[derive(Clone)]
pub struct RealtimeConfig {
    /// Base WebSocket URL (e.g. `wss://ws.example.com`).
    pub host: String,
    /// Application key.
    pub app_key: String,
    /// HTTP endpoint that signs channel subscriptions.
    pub auth_endpoint: String,
    /// Interval between liveness pings.
    pub heartbeat_interval: Duration,
    /// How long to wait for the socket to open.
    pub connect_timeout: Duration,
    /// First reconnect delay; attempt `n` waits `reconnect_base * 2^n`.
    pub reconnect_base: Duration,
    /// Reconnect attempts before giving up for good.
    pub max_reconnect_attempts: u32,
}

impl std::fmt::Debug for RealtimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeConfig")
            .field("host", &self.host)
            .field("app_key", &"[REDACTED]")
            .field("auth_endpoint", &self.auth_endpoint)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("reconnect_base", &self.reconnect_base)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .finish()
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            app_key: String::new(),
            auth_endpoint: String::new(),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            reconnect_base: Duration::from_secs(1),
            max_reconnect_attempts: 5,
        }
    }
}

impl RealtimeConfig {
    /// Build the WebSocket URL for the channel server.
    pub(crate) fn ws_url(&self) -> String {
        format!(
            "{}/app/{}?protocol=7&client=meshcall&version={}&flash=false",
            self.host.trim_end_matches('/'),
            self.app_key,
            env!("CARGO_PKG_VERSION")
        )
    }
}
