//! Peer connection engine backed by the `webrtc` crate

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::config::WebRtcConfig;
use super::engine::{CandidateHandler, PeerConnection, PeerEngine, StateHandler, TrackHandler};
use super::media::{LocalTrack, RemoteTrack, TrackKind};
use super::signaling::{ConnectionState, IceCandidate, SdpType, SessionDescription};
use crate::error::{AppError, Result};

/// Engine creating `webrtc` crate peer connections
pub struct RtcEngine {
    api: API,
}

impl RtcEngine {
    /// Create an engine with the default codecs and interceptors
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }
}

fn ice_servers(config: &WebRtcConfig) -> Vec<RTCIceServer> {
    let mut servers = vec![];

    for stun_url in &config.stun_servers {
        servers.push(RTCIceServer {
            urls: vec![stun_url.clone()],
            ..Default::default()
        });
    }

    for turn in &config.turn_servers {
        servers.push(RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }

    servers
}

#[async_trait]
impl PeerEngine for RtcEngine {
    async fn create_connection(
        &self,
        config: &WebRtcConfig,
        session_id: &str,
    ) -> Result<Arc<dyn PeerConnection>> {
        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(config),
            ice_candidate_pool_size: config.ice_candidate_pool_size,
            ..Default::default()
        };

        debug!(
            "Session {} using {} STUN server(s), TURN configured: {}",
            session_id,
            config.stun_servers.len(),
            config.has_turn()
        );

        let pc = self.api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;

        info!("Peer connection created (session {})", session_id);
        Ok(Arc::new(RtcPeerConnection {
            session_id: session_id.to_string(),
            pc: Arc::new(pc),
        }))
    }
}

/// Peer connection wrapper translating between crate and `webrtc` types
pub struct RtcPeerConnection {
    session_id: String,
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let sdp_type = description.sdp_type;
    let parsed = match sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|e| AppError::WebRtcError(format!("Invalid SDP {}: {}", sdp_type, e)))
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        other => {
            return Err(AppError::WebRtcError(format!(
                "Unexpected description type: {}",
                other
            )))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    let mime_type = match kind {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };
    RTCRtpCodecCapability {
        mime_type: mime_type.to_owned(),
        ..Default::default()
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_local_track(&self, track: &LocalTrack, stream_id: &str) -> Result<()> {
        let local: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind),
            track.id.clone(),
            stream_id.to_string(),
        ));

        let sender = self
            .pc
            .add_track(local)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add {} track: {}", track.kind, e)))?;

        // RTCP has to be drained for interceptors to work
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        debug!("Local {} track {} added", track.kind, track.id);
        Ok(())
    }

    fn on_remote_track(&self, handler: TrackHandler) {
        let handler = Arc::new(handler);
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    handler(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    });
                }
                Box::pin(async {})
            },
        ));
    }

    fn on_local_candidate(&self, handler: CandidateHandler) {
        let handler = Arc::new(handler);
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(init) => {
                            let mut candidate = IceCandidate::new(init.candidate);
                            candidate.sdp_mid = init.sdp_mid;
                            candidate.sdp_mline_index = init.sdp_mline_index;
                            candidate.username_fragment = init.username_fragment;
                            handler(candidate);
                        }
                        Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                    }
                }
                Box::pin(async {})
            }));
    }

    fn on_connection_state_change(&self, handler: StateHandler) {
        let handler = Arc::new(handler);
        let session_id = self.session_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                if let Some(state) = map_state(s) {
                    debug!("Peer {} connection state: {}", session_id, state);
                    handler(state);
                }
                Box::pin(async {})
            }));
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create offer: {}", e)))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))?;
        info!("Peer connection closed (session {})", self.session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::config::TurnServer;

    fn local_config() -> WebRtcConfig {
        WebRtcConfig {
            stun_servers: vec![],
            turn_servers: vec![],
            ice_candidate_pool_size: 0,
        }
    }

    #[test]
    fn test_ice_servers_from_config() {
        let mut config = local_config();
        config.stun_servers = vec!["stun:stun.example.com:3478".to_string()];
        config.turn_servers = vec![TurnServer::new(
            "turn:turn.example.com:3478".to_string(),
            "user".to_string(),
            "secret".to_string(),
        )];

        let servers = ice_servers(&config);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].username, "user");
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let engine = RtcEngine::new().unwrap();
        let config = local_config();

        let caller = engine.create_connection(&config, "caller").await.unwrap();
        let callee = engine.create_connection(&config, "callee").await.unwrap();

        let track = LocalTrack {
            id: "audio-test".to_string(),
            kind: TrackKind::Audio,
        };
        caller.add_local_track(&track, "stream-test").await.unwrap();

        let offer = caller.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.starts_with("v=0"));
        caller.set_local_description(offer.clone()).await.unwrap();

        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        callee.set_local_description(answer.clone()).await.unwrap();

        caller.set_remote_description(answer).await.unwrap();

        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }
}
