//! Relay wire format.
//!
//! Every frame is a JSON envelope `{type, channel, fromUser, toUser?,
//! payload}`. The payload is decoded into a typed [`Signal`] once, when the
//! frame crosses the relay client boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{Error, Result};
use crate::transport::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Join,
    Joined,
    Leave,
    Offer,
    Answer,
    IceCandidate,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Join => write!(f, "join"),
            MessageKind::Joined => write!(f, "joined"),
            MessageKind::Leave => write!(f, "leave"),
            MessageKind::Offer => write!(f, "offer"),
            MessageKind::Answer => write!(f, "answer"),
            MessageKind::IceCandidate => write!(f, "ice-candidate"),
        }
    }
}

/// Raw frame as it travels through the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub channel: String,
    pub from_user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub channel: String,
    pub user_name: String,
}

#[derive(Serialize, Deserialize)]
struct SdpPayload {
    sdp: SessionDescription,
}

#[derive(Serialize, Deserialize)]
struct CandidatePayload {
    candidate: IceCandidate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Join(Membership),
    Joined(Vec<String>),
    Leave(Membership),
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

impl Signal {
    pub fn kind(&self) -> MessageKind {
        match self {
            Signal::Join(_) => MessageKind::Join,
            Signal::Joined(_) => MessageKind::Joined,
            Signal::Leave(_) => MessageKind::Leave,
            Signal::Offer(_) => MessageKind::Offer,
            Signal::Answer(_) => MessageKind::Answer,
            Signal::IceCandidate(_) => MessageKind::IceCandidate,
        }
    }

    fn to_payload(&self) -> Result<Value> {
        let value = match self {
            Signal::Join(m) | Signal::Leave(m) => serde_json::to_value(m)?,
            Signal::Joined(users) => serde_json::to_value(users)?,
            Signal::Offer(sdp) | Signal::Answer(sdp) => {
                serde_json::to_value(SdpPayload { sdp: sdp.clone() })?
            }
            Signal::IceCandidate(candidate) => serde_json::to_value(CandidatePayload {
                candidate: candidate.clone(),
            })?,
        };
        Ok(value)
    }

    fn from_payload(kind: MessageKind, payload: Value) -> Result<Self> {
        let signal = match kind {
            MessageKind::Join => Signal::Join(serde_json::from_value(payload)?),
            MessageKind::Joined => Signal::Joined(serde_json::from_value(payload)?),
            MessageKind::Leave => Signal::Leave(serde_json::from_value(payload)?),
            MessageKind::Offer => {
                Signal::Offer(serde_json::from_value::<SdpPayload>(payload)?.sdp)
            }
            MessageKind::Answer => {
                Signal::Answer(serde_json::from_value::<SdpPayload>(payload)?.sdp)
            }
            MessageKind::IceCandidate => Signal::IceCandidate(
                serde_json::from_value::<CandidatePayload>(payload)?.candidate,
            ),
        };
        Ok(signal)
    }
}

/// A decoded relay message.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalingMessage {
    pub channel: String,
    pub from_user: String,
    /// Intended recipient; `None` means everyone in the channel.
    pub to_user: Option<String>,
    pub signal: Signal,
}

impl SignalingMessage {
    pub fn new(channel: impl Into<String>, from_user: impl Into<String>, signal: Signal) -> Self {
        Self {
            channel: channel.into(),
            from_user: from_user.into(),
            to_user: None,
            signal,
        }
    }

    pub fn to(mut self, user: impl Into<String>) -> Self {
        self.to_user = Some(user.into());
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.signal.kind()
    }

    /// Whether `user` should act on this message.
    pub fn is_for(&self, user: &str) -> bool {
        self.from_user != user && self.to_user.as_deref().map_or(true, |to| to == user)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(&Envelope::try_from(self)?)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        Self::try_from(envelope)
    }
}

impl TryFrom<&SignalingMessage> for Envelope {
    type Error = Error;

    fn try_from(msg: &SignalingMessage) -> Result<Self> {
        Ok(Envelope {
            kind: msg.kind(),
            channel: msg.channel.clone(),
            from_user: msg.from_user.clone(),
            to_user: msg.to_user.clone(),
            payload: msg.signal.to_payload()?,
        })
    }
}

impl TryFrom<Envelope> for SignalingMessage {
    type Error = Error;

    fn try_from(envelope: Envelope) -> Result<Self> {
        let kind = envelope.kind;
        let signal = Signal::from_payload(kind, envelope.payload)
            .map_err(|e| Error::protocol(format!("bad {} payload: {}", kind, e)))?;
        Ok(Self {
            channel: envelope.channel,
            from_user: envelope.from_user,
            to_user: envelope.to_user,
            signal,
        })
    }
}
