//! Wire frames for the Pusher channels protocol (v7, JSON text frames).

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

/// Event names used on the wire.
pub mod events {
    pub const PING: &str = "pusher:ping";
    pub const PONG: &str = "pusher:pong";
    pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
    pub const ERROR: &str = "pusher:error";
    pub const SUBSCRIBE: &str = "pusher:subscribe";
    pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
    pub const SUBSCRIPTION_ERROR: &str = "pusher:subscription_error";
    pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
    pub const MEMBER_ADDED: &str = "pusher_internal:member_added";
    pub const MEMBER_REMOVED: &str = "pusher_internal:member_removed";

    /// Prefix for client-originated (whisper) events.
    pub const CLIENT_PREFIX: &str = "client-";
}

/// Wire name for a whisper event, adding the `client-` prefix once.
pub fn client_event(event: &str) -> String {
    if event.starts_with(events::CLIENT_PREFIX) {
        event.to_string()
    } else {
        format!("{}{event}", events::CLIENT_PREFIX)
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A protocol frame: `{event, data, channel?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            channel: None,
        }
    }

    pub fn on_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn ping() -> Self {
        Self::new(events::PING, Value::Object(Default::default()))
    }

    pub fn pong() -> Self {
        Self::new(events::PONG, Value::Object(Default::default()))
    }

    pub fn subscribe(channel: &str, auth: Option<&str>, channel_data: Option<&str>) -> Self {
        let mut data = serde_json::json!({ "channel": channel });
        if let Some(auth) = auth {
            data["auth"] = Value::String(auth.to_string());
        }
        if let Some(channel_data) = channel_data {
            data["channel_data"] = Value::String(channel_data.to_string());
        }
        Self::new(events::SUBSCRIBE, data)
    }

    pub fn unsubscribe(channel: &str) -> Self {
        Self::new(events::UNSUBSCRIBE, serde_json::json!({ "channel": channel }))
    }

    /// The decoded payload. Servers send `data` as a JSON-encoded string;
    /// clients usually send an object. Both decode to the same value, and a
    /// string that is not JSON is returned unchanged.
    pub fn payload(&self) -> Value {
        match &self.data {
            Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| self.data.clone()),
            other => other.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
