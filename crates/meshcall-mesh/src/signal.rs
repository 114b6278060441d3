//! Signal relay: peer-addressed signaling envelopes carried as whispers on
//! the room channel.
//!
//! The envelope is closed and unversioned. Both ends must know every
//! payload kind; unknown kinds fail to decode and are dropped.

use std::sync::Arc;

use async_trait::async_trait;
use meshcall_common::PeerId;
use meshcall_realtime::{Channel, Outbound, PresenceChannel};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::media::{IceCandidate, SessionDescription};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// `{to, from, data}` as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub to: PeerId,
    pub from: PeerId,
    pub data: SignalData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalData {
    Offer {
        sdp: SessionDescription,
    },
    Answer {
        sdp: SessionDescription,
    },
    Candidate {
        candidate: IceCandidate,
    },
    ScreenShareStatus {
        #[serde(rename = "isSharing")]
        is_sharing: bool,
    },
}

impl SignalData {
    /// Wire name of the payload kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::ScreenShareStatus { .. } => "screenShareStatus",
        }
    }
}

impl SignalEnvelope {
    /// Decode an envelope regardless of its addressee.
    pub fn from_value(value: &Value) -> Option<Self> {
        match serde_json::from_value(value.clone()) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                debug!(error = %e, "Undecodable signal envelope dropped");
                None
            }
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Whisper seam
// ---------------------------------------------------------------------------

/// Anything that can send a whisper on the room channel.
#[async_trait]
pub trait Whisper: Send + Sync {
    async fn whisper(&self, event: &str, data: Value) -> Outbound;
}

#[async_trait]
impl Whisper for Channel {
    async fn whisper(&self, event: &str, data: Value) -> Outbound {
        Channel::whisper(self, event, data).await
    }
}

#[async_trait]
impl Whisper for PresenceChannel {
    async fn whisper(&self, event: &str, data: Value) -> Outbound {
        self.channel().whisper(event, data).await
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Sends and filters signaling envelopes for the local participant.
#[derive(Clone)]
pub struct SignalRelay {
    local: PeerId,
    event: String,
    whisper: Arc<dyn Whisper>,
}

impl SignalRelay {
    pub fn new(local: PeerId, event: impl Into<String>, whisper: Arc<dyn Whisper>) -> Self {
        Self {
            local,
            event: event.into(),
            whisper,
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    /// Whisper `data` to `to`. At most once; no acknowledgment.
    pub async fn send(&self, to: &PeerId, data: SignalData) -> Outbound {
        let envelope = SignalEnvelope {
            to: to.clone(),
            from: self.local.clone(),
            data,
        };
        debug!(peer = %to, kind = envelope.data.kind(), "Sending signal");
        self.whisper.whisper(&self.event, envelope.to_value()).await
    }

    /// Decode an inbound whisper, keeping only envelopes addressed to the
    /// local participant by someone else.
    pub fn accept(&self, payload: &Value) -> Option<SignalEnvelope> {
        let envelope = SignalEnvelope::from_value(payload)?;
        if envelope.to != self.local || envelope.from == self.local {
            return None;
        }
        Some(envelope)
    }
}
