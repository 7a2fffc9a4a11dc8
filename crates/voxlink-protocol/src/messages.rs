use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::DecodeError;

/// Opaque participant identifier (the hosted backend's user id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Opaque chat room identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Session description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Offer or answer exchanged during negotiation.
/// Same JSON shape a browser produces for `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network candidate, `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Broadcast event names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Presence announcement (also re-sent as heartbeat)
    UserJoined,
    /// Presence departure
    UserLeft,
    Offer,
    Answer,
    IceCandidate,
    /// Fallback-path audio fragment
    AudioChunk,
    /// A stored voice message is available
    VoiceMessage,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserJoined => "user-joined",
            Self::UserLeft => "user-left",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::AudioChunk => "audio-chunk",
            Self::VoiceMessage => "voice-message",
        }
    }

    pub fn from_event(event: &str) -> Option<Self> {
        match event {
            "user-joined" => Some(Self::UserJoined),
            "user-left" => Some(Self::UserLeft),
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "ice-candidate" => Some(Self::IceCandidate),
            "audio-chunk" => Some(Self::AudioChunk),
            "voice-message" => Some(Self::VoiceMessage),
            _ => None,
        }
    }
}

/// Every message that travels over a voice broadcast topic.
///
/// Topics are shared by all participants, so targeted messages carry the
/// intended recipient and receivers filter for themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SignalMessage {
    #[serde(rename_all = "camelCase")]
    UserJoined { user_id: UserId },

    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: UserId },

    #[serde(rename_all = "camelCase")]
    Offer {
        offer: SessionDescription,
        from_user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_user_id: Option<UserId>,
    },

    #[serde(rename_all = "camelCase")]
    Answer {
        answer: SessionDescription,
        to_user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<UserId>,
    },

    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: IceCandidate,
        from_user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_user_id: Option<UserId>,
    },

    #[serde(rename_all = "camelCase")]
    AudioChunk {
        /// Base64 fragment container
        audio_data: String,
        user_id: UserId,
        /// Capture time, Unix milliseconds
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },

    #[serde(rename_all = "camelCase")]
    VoiceMessage {
        message_id: String,
        sender_id: UserId,
        /// Seconds
        duration: f64,
        /// RFC 3339
        timestamp: String,
    },
}

impl SignalMessage {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::UserJoined { .. } => SignalKind::UserJoined,
            Self::UserLeft { .. } => SignalKind::UserLeft,
            Self::Offer { .. } => SignalKind::Offer,
            Self::Answer { .. } => SignalKind::Answer,
            Self::IceCandidate { .. } => SignalKind::IceCandidate,
            Self::AudioChunk { .. } => SignalKind::AudioChunk,
            Self::VoiceMessage { .. } => SignalKind::VoiceMessage,
        }
    }

    /// Split into a broadcast envelope (event name + untagged payload)
    pub fn to_envelope(&self) -> Result<Envelope, DecodeError> {
        let mut payload =
            serde_json::to_value(self).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        if let Value::Object(map) = &mut payload {
            map.remove("event");
        }
        Ok(Envelope {
            event: self.kind().as_str().to_string(),
            payload,
        })
    }

    /// Rebuild a message from a broadcast envelope.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, DecodeError> {
        if SignalKind::from_event(&envelope.event).is_none() {
            return Err(DecodeError::Malformed(format!(
                "unknown event '{}'",
                envelope.event
            )));
        }

        let mut payload = match &envelope.payload {
            Value::Object(map) => map.clone(),
            other => {
                return Err(DecodeError::Malformed(format!(
                    "payload for '{}' is not an object: {other}",
                    envelope.event
                )))
            }
        };
        payload.insert("event".into(), Value::String(envelope.event.clone()));

        serde_json::from_value(Value::Object(payload))
            .map_err(|e| DecodeError::Malformed(format!("{}: {e}", envelope.event)))
    }
}

/// Transport-level unit: what a broadcast topic actually carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub payload: Value,
}
