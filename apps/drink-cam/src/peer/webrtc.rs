use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{PeerError, PeerEventKind, PeerEventSink, PeerFactory, PeerSession, PeerState, SdpKind};
use crate::media::{InboundStream, LocalMedia};
use crate::protocol::{IceCandidate, Role};

const ICE_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(3);
const ICE_FAILED_TIMEOUT: Duration = Duration::from_secs(10);
const ICE_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);
const RTP_BUFFER: usize = 256;

/// Builds webrtc-rs peer connections sharing one API instance.
pub struct WebRtcPeerFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, PeerError> {
        Ok(Self {
            api: build_api()?,
            ice_servers,
        })
    }
}

fn build_api() -> Result<API, PeerError> {
    let mut media = MediaEngine::default();
    media
        .register_default_codecs()
        .map_err(|err| PeerError::Setup(err.to_string()))?;
    let registry = register_default_interceptors(Registry::new(), &mut media)
        .map_err(|err| PeerError::Setup(err.to_string()))?;

    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(ICE_DISCONNECTED_TIMEOUT),
        Some(ICE_FAILED_TIMEOUT),
        Some(ICE_KEEPALIVE_INTERVAL),
    );

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting)
        .build())
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        role: Role,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerSession>, PeerError> {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|err| PeerError::Setup(err.to_string()))?,
        );
        let generation = events.generation();
        register_callbacks(&pc, role, events);
        debug!(target = "drink_cam::peer", generation, %role, "peer connection created");
        Ok(Arc::new(WebRtcPeerSession { pc, generation }))
    }
}

fn register_callbacks(pc: &RTCPeerConnection, role: Role, events: PeerEventSink) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    events.emit(PeerEventKind::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(err) => {
                    warn!(
                        target = "drink_cam::peer",
                        error = %err,
                        "failed to serialize local candidate",
                    );
                }
            }
        })
    }));

    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = state_events.clone();
        Box::pin(async move {
            trace!(
                target = "drink_cam::peer",
                generation = events.generation(),
                ?state,
                "peer state",
            );
            events.emit(PeerEventKind::StateChanged(map_state(state)));
        })
    }));

    if role != Role::Viewer {
        return;
    }
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let events = events.clone();
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(RTP_BUFFER);
            let stream = InboundStream {
                stream_id: track.stream_id(),
                track_id: track.id(),
                mime_type: track.codec().capability.mime_type.clone(),
                packets: rx,
            };
            if !events.emit(PeerEventKind::RemoteTrack(stream)) {
                return;
            }
            tokio::spawn(async move {
                loop {
                    match track.read_rtp().await {
                        Ok((packet, _)) => {
                            if tx.send(packet).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            trace!(target = "drink_cam::peer", error = %err, "remote track ended");
                            break;
                        }
                    }
                }
            });
        })
    }));
}

fn map_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

struct WebRtcPeerSession {
    pc: Arc<RTCPeerConnection>,
    generation: u64,
}

fn negotiation(err: webrtc::Error) -> PeerError {
    PeerError::Negotiation(err.to_string())
}

#[async_trait]
impl PeerSession for WebRtcPeerSession {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<(), PeerError> {
        let sender = self
            .pc
            .add_track(media.track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|err| PeerError::Setup(err.to_string()))?;
        // RTCP has to be drained for interceptors like NACK to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await.map_err(negotiation)?;
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await.map_err(negotiation)?;
        Ok(sdp)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), PeerError> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_owned()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_owned()),
        }
        .map_err(negotiation)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(negotiation)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| PeerError::MalformedCandidate(err.to_string()))
    }

    async fn detach(&self) {
        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
    }

    async fn close(&self) -> Result<(), PeerError> {
        debug!(target = "drink_cam::peer", generation = self.generation, "closing peer connection");
        self.pc
            .close()
            .await
            .map_err(|err| PeerError::Setup(err.to_string()))
    }
}
