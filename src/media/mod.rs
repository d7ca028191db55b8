use crate::error::MediaError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod webrtc;
pub use webrtc::WebrtcMedia;

/// Opaque session-description payload. Shape is validated at the adapter
/// boundary, never inside the coordinator.
pub type SdpPayload = serde_json::Value;
/// Opaque ICE candidate payload.
pub type CandidatePayload = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events surfaced by a peer session back into the coordinator loop.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(CandidatePayload),
    /// The first remote media track arrived.
    RemoteTrack,
    ConnectionState(PeerConnectionState),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;
pub type PeerEventReceiver = mpsc::UnboundedReceiver<PeerEvent>;

/// Locally acquired camera/microphone media. `release` must be safe to call
/// more than once.
#[async_trait]
pub trait LocalMedia: Send + Sync {
    async fn release(&self);

    fn as_any(&self) -> &dyn Any;
}

/// One peer-connection handle scoped to a single call attempt.
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn create_offer(&self) -> Result<SdpPayload, MediaError>;

    async fn create_answer(&self) -> Result<SdpPayload, MediaError>;

    async fn set_remote_description(&self, sdp: SdpPayload) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: CandidatePayload) -> Result<(), MediaError>;

    async fn close(&self);
}

/// Narrow boundary over the platform media and peer-connection primitives.
/// The coordinator drives calls exclusively through this trait; tests swap in
/// a fake, production uses [`WebrtcMedia`].
#[async_trait]
pub trait MediaAdapter: Send + Sync {
    async fn acquire_local_media(&self) -> Result<Arc<dyn LocalMedia>, MediaError>;

    async fn create_session(
        &self,
        local: Arc<dyn LocalMedia>,
        events: PeerEventSender,
    ) -> Result<Arc<dyn MediaSession>, MediaError>;
}

pub type MediaAdapterRef = Arc<dyn MediaAdapter>;
