//! Connection state, lifecycle events and outbound results.

use std::time::Duration;

use meshcall_common::SocketId;

/// Where the connection loop currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never started, or stopped after `disconnect()`.
    Idle,
    Connecting,
    Connected { socket_id: SocketId },
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting { attempt: u32, delay: Duration },
    /// Attempt cap exhausted; only an explicit `connect()` restarts.
    PermanentlyDisconnected,
    /// Closed normally (explicit disconnect or server close code 1000).
    Closed,
}

/// Lifecycle events published to any number of listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected {
        socket_id: SocketId,
    },
    Disconnected {
        code: u16,
        reason: String,
    },
    Error(String),
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    PermanentlyDisconnected,
}

/// Result of handing a frame to the socket writer.
///
/// `Queued` means the frame reached the writer of the live socket; it is not
/// an acknowledgment and the frame may still be lost with the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Outbound {
    Queued,
    Dropped,
}

impl Outbound {
    pub fn is_queued(self) -> bool {
        matches!(self, Self::Queued)
    }
}

/// Close code for a normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when the socket vanished without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;
