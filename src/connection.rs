use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Negotiation progress of one peer connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl NegotiationState {
    /// Both descriptions are applied.
    pub fn is_negotiated(self) -> bool {
        matches!(
            self,
            NegotiationState::Stable
                | NegotiationState::Connecting
                | NegotiationState::Connected
                | NegotiationState::Disconnected
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::New => write!(f, "new"),
            NegotiationState::HaveLocalOffer => write!(f, "have-local-offer"),
            NegotiationState::HaveRemoteOffer => write!(f, "have-remote-offer"),
            NegotiationState::Stable => write!(f, "stable"),
            NegotiationState::Connecting => write!(f, "connecting"),
            NegotiationState::Connected => write!(f, "connected"),
            NegotiationState::Disconnected => write!(f, "disconnected"),
            NegotiationState::Failed => write!(f, "failed"),
            NegotiationState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Offerer,
    Answerer,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Offerer => write!(f, "offerer"),
            PeerRole::Answerer => write!(f, "answerer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Joining,
    Joined,
    Leaving,
    Left,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Joining => write!(f, "Joining"),
            SessionState::Joined => write!(f, "Joined"),
            SessionState::Leaving => write!(f, "Leaving"),
            SessionState::Left => write!(f, "Left"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    pub role: PeerRole,
    pub state: NegotiationState,
    pub last_error: Option<String>,
}

/// Observable state of a signaling session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub channel: Option<String>,
    pub user: Option<String>,
    /// Last membership list announced by the relay.
    pub members: Vec<String>,
    pub peers: BTreeMap<String, PeerStatus>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            channel: None,
            user: None,
            members: Vec::new(),
            peers: BTreeMap::new(),
        }
    }
}

impl SessionSnapshot {
    pub fn peer(&self, user: &str) -> Option<&PeerStatus> {
        self.peers.get(user)
    }
}

/// Publishes [`SessionSnapshot`]s to any number of observers.
#[derive(Clone)]
pub struct SessionMonitor {
    status: Arc<watch::Sender<SessionSnapshot>>,
}

impl SessionMonitor {
    pub fn new() -> Self {
        let (status, _) = watch::channel(SessionSnapshot::default());
        Self {
            status: Arc::new(status),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut SessionSnapshot)) {
        self.status.send_if_modified(|snapshot| {
            let before = snapshot.clone();
            f(snapshot);
            *snapshot != before
        });
    }

    pub fn current(&self) -> SessionSnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.status.subscribe()
    }
}

impl Default for SessionMonitor {
    fn default() -> Self {
        Self::new()
    }
}
