//! Per-peer connection bookkeeping: who offers, where negotiation stands,
//! and candidates that arrived too early to apply.

use std::collections::VecDeque;
use std::sync::Arc;

use meshcall_common::PeerId;

use crate::media::{IceCandidate, PeerConnection};

/// Negotiation lifecycle of one peer, as published to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerPhase {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Closed,
}

/// The side with the smaller id creates the offer. Both sides compute the
/// same answer for any pair, so exactly one of them offers.
pub fn is_initiator(local: &PeerId, remote: &PeerId) -> bool {
    local < remote
}

/// Remote candidates received before the remote description was applied.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
}

impl CandidateQueue {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    /// Take every queued candidate in arrival order.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

pub(crate) struct PeerEntry {
    pub(crate) connection: Arc<dyn PeerConnection>,
    pub(crate) epoch: u64,
    pub(crate) phase: PeerPhase,
    pub(crate) initiator: bool,
    pub(crate) candidates: CandidateQueue,
    /// An offer was requested while one was already outstanding.
    pub(crate) renegotiate_pending: bool,
    pub(crate) remote_description_set: bool,
}

impl PeerEntry {
    pub(crate) fn new(connection: Arc<dyn PeerConnection>, epoch: u64, initiator: bool) -> Self {
        Self {
            connection,
            epoch,
            phase: PeerPhase::New,
            initiator,
            candidates: CandidateQueue::default(),
            renegotiate_pending: false,
            remote_description_set: false,
        }
    }
}
