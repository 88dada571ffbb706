//! Peer-to-peer call client core: relay signaling, per-peer negotiation and
//! local media capture.

pub mod audio;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod webrtc;

pub use config::{ClientConfig, IceServer, ReconnectPolicy};
pub use connection::{NegotiationState, PeerRole, PeerStatus, SessionSnapshot, SessionState};
pub use error::{Error, Result};
pub use relay::{RelayClient, RelayConnector, RelayState, RelayStatus, WebSocketConnector};
pub use session::{SessionBuilder, SessionHandle};
pub use signaling::{MessageKind, Signal, SignalingMessage};

/// Initialize tracing with sensible defaults.
///
/// Log level is controlled by the `RUST_LOG` environment variable.
/// Defaults to `info` if not set. Does nothing if a subscriber is already
/// installed.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Initialize tracing with a specific default level.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
