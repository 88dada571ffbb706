//! Transport engine backed by webrtc-rs.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{ClientConfig, IceServer};
use crate::connection::NegotiationState;
use crate::error::{Error, Result};
use crate::media::{LocalTrack, TrackKind};
use crate::transport::{
    IceCandidate, PeerEvent, PeerEventHandler, RemoteTrack, RtcConnection, RtcEngine, SdpKind,
    SessionDescription,
};

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

impl From<RTCPeerConnectionState> for NegotiationState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => NegotiationState::Connecting,
            RTCPeerConnectionState::Connected => NegotiationState::Connected,
            RTCPeerConnectionState::Disconnected => NegotiationState::Disconnected,
            RTCPeerConnectionState::Failed => NegotiationState::Failed,
            RTCPeerConnectionState::Closed => NegotiationState::Closed,
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                NegotiationState::New
            }
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|e| Error::negotiation(format!("malformed {:?} sdp: {}", description.kind, e)))
}

fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Creates webrtc-rs peer connections with the default codecs and
/// interceptors.
pub struct WebRtcEngine {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcEngine {
    pub fn new(ice_servers: &[IceServer]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: ice_servers.iter().map(RTCIceServer::from).collect(),
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::new(&config.ice_servers)
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    async fn create_connection(
        &self,
        on_event: PeerEventHandler,
    ) -> Result<Arc<dyn RtcConnection>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(self.api.new_peer_connection(config).await?);
        let connection = WebRtcConnection {
            peer_connection,
            stream_id: random_id(),
            senders: Mutex::new(HashMap::new()),
        };
        connection.install_handlers(on_event);
        debug!(stream = %connection.stream_id, "peer connection created");
        Ok(Arc::new(connection))
    }
}

/// A remote track received over a webrtc-rs connection.
pub struct WebRtcRemoteTrack {
    track: Arc<TrackRemote>,
}

impl WebRtcRemoteTrack {
    /// RTP source for decoding and playback.
    pub fn track(&self) -> &Arc<TrackRemote> {
        &self.track
    }
}

impl fmt::Debug for WebRtcRemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcRemoteTrack")
            .field("id", &self.track.id())
            .field("kind", &self.track.kind())
            .finish()
    }
}

impl RemoteTrack for WebRtcRemoteTrack {
    fn id(&self) -> String {
        self.track.id()
    }

    fn kind(&self) -> TrackKind {
        match self.track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct LocalSender {
    sample_track: Arc<TrackLocalStaticSample>,
    rtp_sender: Arc<RTCRtpSender>,
}

pub struct WebRtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
    /// Stream id announced for every local track of this connection.
    stream_id: String,
    senders: Mutex<HashMap<String, LocalSender>>,
}

impl WebRtcConnection {
    fn install_handlers(&self, on_event: PeerEventHandler) {
        let handler = on_event.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let handler = handler.clone();
                Box::pin(async move {
                    // `None` marks the end of gathering.
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => handler(PeerEvent::LocalCandidate(init.into())),
                        Err(e) => warn!("failed to serialize local candidate: {}", e),
                    }
                })
            }));

        let handler = on_event.clone();
        self.peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let handler = handler.clone();
                Box::pin(async move {
                    let stream_id = track.stream_id();
                    info!(
                        track = %track.id(),
                        stream = %stream_id,
                        kind = %track.kind(),
                        "remote track received"
                    );
                    handler(PeerEvent::RemoteTrack {
                        stream_id,
                        track: Arc::new(WebRtcRemoteTrack { track }),
                    });
                })
            },
        ));

        let handler = on_event;
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let handler = handler.clone();
                Box::pin(async move {
                    debug!("peer connection state changed: {}", state);
                    handler(PeerEvent::StateChanged(state.into()));
                })
            }));
    }

    fn clear_handlers(&self) {
        self.peer_connection
            .on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.peer_connection
            .on_track(Box::new(|_, _, _| Box::pin(async {})));
        self.peer_connection
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
    }

    /// Sample writer feeding the given local track, for the media pipeline
    /// that encodes captured frames.
    pub async fn sample_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.senders
            .lock()
            .await
            .get(track_id)
            .map(|s| s.sample_track.clone())
    }
}

#[async_trait]
impl RtcConnection for WebRtcConnection {
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()> {
        let mime_type = match track.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id().to_owned(),
            self.stream_id.clone(),
        ));
        let rtp_sender = self
            .peer_connection
            .add_track(Arc::clone(&sample_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        self.senders.lock().await.insert(
            track.id().to_owned(),
            LocalSender {
                sample_track,
                rtp_sender,
            },
        );
        debug!(track = track.id(), kind = %track.kind(), "local track added");
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        let Some(sender) = self.senders.lock().await.remove(track_id) else {
            return Ok(());
        };
        self.peer_connection.remove_track(&sender.rtp_sender).await?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::negotiation(format!("create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::negotiation(format!("create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(|e| Error::negotiation(format!("set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| Error::negotiation(format!("set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let text = candidate.candidate.clone();
        self.peer_connection
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| Error::InvalidCandidate(format!("{}: {}", text, e)))
    }

    async fn close(&self) -> Result<()> {
        self.clear_handlers();
        self.senders.lock().await.clear();
        self.peer_connection.close().await?;
        Ok(())
    }
}
