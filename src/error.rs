use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

#[derive(Debug, Error)]
pub enum Error {
    /// The platform refused access to capture hardware.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The requested device is busy, unplugged or unknown.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("device enumeration failed: {0}")]
    EnumerationFailed(String),

    /// Acquisition failed with the stored constraints and with the defaults.
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(#[source] Box<Error>),

    #[error("negotiation error: {0}")]
    NegotiationError(String),

    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("relay disconnected")]
    RelayDisconnected,

    /// Answer or candidate without a matching peer connection record.
    #[error("stale message from {0}")]
    StaleMessage(String),

    #[error("operation not allowed while {0}")]
    InvalidState(String),

    #[error("no remote peers in channel")]
    NoRemotePeers,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::NegotiationError(msg.to_string())
    }

    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    pub fn persistence(msg: impl std::fmt::Display) -> Self {
        Self::Persistence(msg.to_string())
    }

    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Whether the error should be shown to the user rather than only logged.
    pub fn is_user_facing(&self) -> bool {
        match self {
            Error::PermissionDenied(_) | Error::NegotiationError(_) => true,
            Error::CaptureUnavailable(_) => true,
            _ => false,
        }
    }

    /// Whether this error, or the cause of a failed capture, is a permission
    /// denial.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Error::PermissionDenied(_) => true,
            Error::CaptureUnavailable(cause) => cause.is_permission_denied(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
