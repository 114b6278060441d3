use meshcall_common::MeshcallError;
use meshcall_realtime::RealtimeError;

/// Failures reported by the media platform.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("duplicate ICE candidate")]
    DuplicateCandidate,

    #[error("peer connection is closed")]
    ConnectionClosed,

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("media platform error: {0}")]
    Platform(String),
}

impl MediaError {
    /// Candidate failures that are expected during normal negotiation:
    /// duplicates and candidates arriving after the connection closed.
    pub fn is_benign_candidate_error(&self) -> bool {
        matches!(self, Self::DuplicateCandidate | Self::ConnectionClosed)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MeshError {
    #[error(transparent)]
    Realtime(#[from] RealtimeError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("presence channel did not publish a local member")]
    NoLocalMember,

    #[error("room is closed")]
    RoomClosed,
}

impl From<MeshError> for MeshcallError {
    fn from(err: MeshError) -> Self {
        match err {
            MeshError::Realtime(e) => MeshcallError::Realtime(e.to_string()),
            MeshError::Media(e) => MeshcallError::Media(e.to_string()),
            other => MeshcallError::Other(other.to_string()),
        }
    }
}
