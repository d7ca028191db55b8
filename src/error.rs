use thiserror::Error;

/// Fatal outcomes of a call attempt. Every variant except
/// [`CallError::MediaAcquisition`] (which can fail before a record exists)
/// also funnels through the termination guard so the shared record always
/// ends with a well-defined reason.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),
    #[error("signaling write failed: {0}")]
    SignalingWrite(String),
    #[error("remote description rejected: {0}")]
    RemoteDescription(String),
    #[error("peer connection failed: {0}")]
    ConnectionFailure(String),
    #[error("{operation} is not valid in state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
}

/// Errors at the media/transport adapter boundary. Payload shape is only
/// validated here; the coordinator treats descriptions and candidates as
/// opaque blobs.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("camera/microphone unavailable: {0}")]
    Acquisition(String),
    #[error("description negotiation failed: {0}")]
    Negotiation(String),
    #[error("malformed remote description: {0}")]
    RemoteDescription(String),
    #[error("malformed ice candidate: {0}")]
    Candidate(String),
    #[error("peer session closed")]
    Closed,
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::Acquisition(msg) => CallError::MediaAcquisition(msg),
            MediaError::Negotiation(msg)
            | MediaError::RemoteDescription(msg)
            | MediaError::Candidate(msg) => CallError::RemoteDescription(msg),
            MediaError::Closed => CallError::ConnectionFailure("peer session closed".to_string()),
        }
    }
}
