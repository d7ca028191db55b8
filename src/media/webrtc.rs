use super::{
    CandidatePayload, LocalMedia, MediaAdapter, MediaSession, PeerConnectionState, PeerEvent,
    PeerEventSender, SdpPayload,
};
use crate::config::IceServerItem;
use crate::error::MediaError;
use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

impl From<RTCPeerConnectionState> for PeerConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => PeerConnectionState::New,
            RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
            RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
            RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
            RTCPeerConnectionState::Unspecified => PeerConnectionState::New,
        }
    }
}

/// [`MediaAdapter`] over webrtc-rs. One instance per device; each call
/// attempt gets its own peer connection via [`MediaAdapter::create_session`].
pub struct WebrtcMedia {
    ice_servers: Vec<IceServerItem>,
}

impl WebrtcMedia {
    pub fn new(ice_servers: Vec<IceServerItem>) -> Self {
        Self { ice_servers }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice_servers
            .iter()
            .map(|item| RTCIceServer {
                urls: item.urls.clone(),
                username: item.username.clone().unwrap_or_default(),
                credential: item.password.clone().unwrap_or_default(),
            })
            .collect();
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaAdapter for WebrtcMedia {
    async fn acquire_local_media(&self) -> Result<Arc<dyn LocalMedia>, MediaError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            "kincall-local".to_string(),
        ));
        Ok(Arc::new(WebrtcLocalMedia {
            track,
            released: AtomicBool::new(false),
        }))
    }

    async fn create_session(
        &self,
        local: Arc<dyn LocalMedia>,
        events: PeerEventSender,
    ) -> Result<Arc<dyn MediaSession>, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::Negotiation(e.to_string()))?;
        let registry = Registry::new();
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = api
            .new_peer_connection(self.rtc_configuration())
            .await
            .map_err(|e| MediaError::Negotiation(e.to_string()))?;
        let pc = Arc::new(pc);

        let local = local
            .as_any()
            .downcast_ref::<WebrtcLocalMedia>()
            .ok_or_else(|| {
                MediaError::Acquisition("local media not acquired by this adapter".to_string())
            })?;
        pc.add_track(local.track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| MediaError::Negotiation(e.to_string()))?;

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let candidate_events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => match serde_json::to_value(&init) {
                        Ok(payload) => {
                            let _ = candidate_events.send(PeerEvent::LocalCandidate(payload));
                        }
                        Err(e) => warn!("failed to serialize local candidate: {}", e),
                    },
                    Err(e) => warn!("failed to marshal local candidate: {}", e),
                }
            })
        }));

        let first_track = Arc::new(AtomicBool::new(false));
        let track_events = events.clone();
        pc.on_track(Box::new(move |track, _, _| {
            let first = !first_track.swap(true, Ordering::SeqCst);
            debug!(track_id = %track.id(), first, "remote track arrived");
            if first {
                let _ = track_events.send(PeerEvent::RemoteTrack);
            }
            Box::pin(async {})
        }));

        pc.on_peer_connection_state_change(Box::new(move |state| {
            let mapped: PeerConnectionState = state.into();
            info!("peer connection state changed: {:?}", mapped);
            let _ = events.send(PeerEvent::ConnectionState(mapped));
            Box::pin(async {})
        }));

        Ok(Arc::new(WebrtcSession { pc }))
    }
}

/// Local microphone track. Capture feeding the track lives outside this
/// crate; release just marks the handle dead so a late capture loop stops.
pub struct WebrtcLocalMedia {
    track: Arc<TrackLocalStaticSample>,
    released: AtomicBool,
}

impl WebrtcLocalMedia {
    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalMedia for WebrtcLocalMedia {
    async fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct WebrtcSession {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaSession for WebrtcSession {
    async fn create_offer(&self) -> Result<SdpPayload, MediaError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| MediaError::Negotiation(e.to_string()))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| MediaError::Negotiation(e.to_string()))?;
        serde_json::to_value(&offer).map_err(|e| MediaError::Negotiation(e.to_string()))
    }

    async fn create_answer(&self) -> Result<SdpPayload, MediaError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::Negotiation(e.to_string()))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| MediaError::Negotiation(e.to_string()))?;
        serde_json::to_value(&answer).map_err(|e| MediaError::Negotiation(e.to_string()))
    }

    async fn set_remote_description(&self, sdp: SdpPayload) -> Result<(), MediaError> {
        let description: RTCSessionDescription =
            serde_json::from_value(sdp).map_err(|e| MediaError::RemoteDescription(e.to_string()))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| MediaError::RemoteDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: CandidatePayload) -> Result<(), MediaError> {
        let init: RTCIceCandidateInit =
            serde_json::from_value(candidate).map_err(|e| MediaError::Candidate(e.to_string()))?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| MediaError::Candidate(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("peer connection close: {}", e);
        }
    }
}
