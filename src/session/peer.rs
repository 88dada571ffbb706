use std::sync::Arc;

use crate::connection::{NegotiationState, PeerRole, PeerStatus};
use crate::transport::{IceCandidate, RtcConnection, SessionDescription};

/// Progress of applying the remote description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoteDescription {
    Missing,
    Applying,
    Applied,
}

/// Negotiation state kept for one remote participant.
///
/// Every asynchronous step started for a record carries its `generation`;
/// a completion whose generation no longer matches the record for that peer
/// belongs to a torn-down record and is discarded.
pub(crate) struct PeerRecord {
    pub generation: u64,
    pub role: PeerRole,
    pub state: NegotiationState,
    /// `None` until the engine has created the connection.
    pub connection: Option<Arc<dyn RtcConnection>>,
    /// Offer received before the connection existed.
    pub pending_remote_description: Option<SessionDescription>,
    pub remote: RemoteDescription,
    pub local_description_sent: bool,
    /// Remote candidates waiting for the remote description.
    pub pending_remote_candidates: Vec<IceCandidate>,
    /// Local candidates waiting for the offer or answer to go out.
    pub pending_local_candidates: Vec<IceCandidate>,
    /// Stream currently attached to the sink for this peer.
    pub remote_stream: Option<String>,
    pub last_error: Option<String>,
}

impl PeerRecord {
    pub fn new(generation: u64, role: PeerRole, early_candidates: Vec<IceCandidate>) -> Self {
        Self {
            generation,
            role,
            state: NegotiationState::New,
            connection: None,
            pending_remote_description: None,
            remote: RemoteDescription::Missing,
            local_description_sent: false,
            pending_remote_candidates: early_candidates,
            pending_local_candidates: Vec::new(),
            remote_stream: None,
            last_error: None,
        }
    }

    /// Moves the signaling state forward without undoing progress the
    /// transport already reported.
    pub fn advance(&mut self, state: NegotiationState) {
        let transport_reported = matches!(
            self.state,
            NegotiationState::Connecting
                | NegotiationState::Connected
                | NegotiationState::Disconnected
                | NegotiationState::Failed
                | NegotiationState::Closed
        );
        if !transport_reported {
            self.state = state;
        }
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            role: self.role,
            state: self.state,
            last_error: self.last_error.clone(),
        }
    }
}
