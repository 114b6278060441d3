//! Channel subscription authorization.
//!
//! Every subscription is signed out of band: the client posts
//! `{channel_name, socket_id}` with its bearer credential and receives the
//! `auth` signature (plus `channel_data` for presence channels).

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use meshcall_common::SocketId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RealtimeError;

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// Hot-swappable bearer credential shared by every clone.
///
/// Swapping does not touch live subscriptions; only authentications that
/// start afterwards see the new value.
#[derive(Clone, Default)]
pub struct Credential {
    token: Arc<RwLock<String>>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(token.into())),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = token.into();
    }

    pub fn current(&self) -> String {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

// ---------------------------------------------------------------------------
// Auth payloads
// ---------------------------------------------------------------------------

/// Request body sent to the auth endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AuthRequest<'a> {
    pub channel_name: &'a str,
    pub socket_id: &'a str,
}

/// Signed subscription returned by the auth endpoint.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct ChannelAuth {
    pub auth: String,
    /// JSON string describing the local member, presence channels only.
    #[serde(default)]
    pub channel_data: Option<String>,
}

impl std::fmt::Debug for ChannelAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelAuth")
            .field("auth", &"[REDACTED]")
            .field("channel_data", &self.channel_data)
            .finish()
    }
}

/// Signs channel subscriptions.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        channel: &str,
        socket_id: &SocketId,
        credential: &str,
    ) -> Result<ChannelAuth, RealtimeError>;
}

// ---------------------------------------------------------------------------
// HTTP authorizer
// ---------------------------------------------------------------------------

/// Authorizer backed by an HTTP endpoint.
pub struct HttpAuthorizer {
    endpoint: String,
    http: reqwest::Client,
}

impl HttpAuthorizer {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, RealtimeError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RealtimeError::Auth(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.into(),
            http,
        })
    }
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn authorize(
        &self,
        channel: &str,
        socket_id: &SocketId,
        credential: &str,
    ) -> Result<ChannelAuth, RealtimeError> {
        debug!(channel = %channel, "Requesting channel authorization");

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(credential)
            .header("accept", "application/json")
            .json(&AuthRequest {
                channel_name: channel,
                socket_id: socket_id.as_str(),
            })
            .send()
            .await
            .map_err(|e| RealtimeError::Auth(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        parse_auth_response(channel, status.as_u16(), &body)
    }
}

/// Interpret an auth endpoint response. Any non-2xx status is a hard failure.
pub fn parse_auth_response(
    channel: &str,
    status: u16,
    body: &str,
) -> Result<ChannelAuth, RealtimeError> {
    if !(200..300).contains(&status) {
        return Err(RealtimeError::AuthRejected {
            channel: channel.to_string(),
            status,
        });
    }
    serde_json::from_str(body)
        .map_err(|e| RealtimeError::Auth(format!("invalid auth response: {e}")))
}
