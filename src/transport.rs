//! The peer connection capability the signaling session drives.
//!
//! SDP parsing, ICE gathering and media encoding live behind [`RtcEngine`];
//! the session only moves descriptions and candidates around.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::connection::NegotiationState;
use crate::error::Result;
use crate::media::{LocalTrack, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// `{"type": "offer" | "answer", "sdp": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Self::default()
        }
    }
}

/// A track received from a remote peer.
pub trait RemoteTrack: fmt::Debug + Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> TrackKind;

    /// Access to the engine-specific track for rendering.
    fn as_any(&self) -> &dyn Any;
}

/// Remote media grouped under the stream id the sender announced.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<Arc<dyn RemoteTrack>>,
}

/// Events raised by a peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack {
        stream_id: String,
        track: Arc<dyn RemoteTrack>,
    },
    StateChanged(NegotiationState),
}

pub type PeerEventHandler = Arc<dyn Fn(PeerEvent) + Send + Sync>;

#[async_trait]
pub trait RtcEngine: Send + Sync {
    /// Creates a connection that reports its events through `on_event` until
    /// it is closed.
    async fn create_connection(&self, on_event: PeerEventHandler) -> Result<Arc<dyn RtcConnection>>;
}

#[async_trait]
pub trait RtcConnection: Send + Sync {
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()>;

    async fn remove_track(&self, track_id: &str) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Fails with `NegotiationError`.
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Fails with `NegotiationError`.
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Fails with `InvalidCandidate`.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Detaches the event handler and releases the connection.
    async fn close(&self) -> Result<()>;
}

/// Where remote media is rendered. Implemented by the UI layer.
pub trait RemoteMediaSink: Send + Sync {
    /// A new remote stream replaces whatever `peer`'s sink displayed.
    fn attach(&self, peer: &str, stream: RemoteStream);

    /// Another track arrived for the stream already attached.
    fn track_added(&self, _peer: &str, _track: Arc<dyn RemoteTrack>) {}

    /// The peer's connection was torn down.
    fn detach(&self, peer: &str);
}

/// Sink that drops remote media.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RemoteMediaSink for NullSink {
    fn attach(&self, _peer: &str, _stream: RemoteStream) {}

    fn detach(&self, _peer: &str) {}
}
