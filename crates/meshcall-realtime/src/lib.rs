//! Client for Pusher-protocol realtime channel servers.
//!
//! One [`RealtimeClient`] owns one socket. Channels opened through it
//! ([`RealtimeClient::join`], [`RealtimeClient::private`],
//! [`RealtimeClient::presence`]) are authenticated out of band, multiplexed
//! over that socket and resubscribed automatically after a reconnect.

pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod presence;
mod registry;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{Authorizer, ChannelAuth, Credential, HttpAuthorizer};
pub use channel::{Channel, PresenceChannel};
pub use client::RealtimeClient;
pub use config::RealtimeConfig;
pub use error::RealtimeError;
pub use frame::Frame;
pub use presence::{Member, Roster};
pub use registry::ChannelKind;
pub use transport::{ConnectionState, Outbound, TransportEvent};
