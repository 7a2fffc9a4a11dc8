use thiserror::Error;

use voxlink_protocol::{DecodeError, UserId};

/// Microphone acquisition failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("No capture device: {0}")]
    NoDevice(String),

    #[error("Capture device error: {0}")]
    Device(String),
}

/// Broadcast topic failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Send on '{topic}' failed: {reason}")]
    Send { topic: String, reason: String },

    #[error("Transport closed")]
    Closed,
}

/// Per-peer negotiation failures. Contained to the peer that raised them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Unexpected {message} in state {state}")]
    UnexpectedMessage { message: String, state: String },

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("No answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Media engine error: {0}")]
    Engine(String),
}

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Media access error: {0}")]
    MediaAccess(#[from] MediaAccessError),

    #[error("Signaling delivery error: {0}")]
    SignalingDelivery(#[from] TransportError),

    #[error("Negotiation with {peer} failed: {source}")]
    Negotiation {
        peer: UserId,
        #[source]
        source: NegotiationError,
    },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Already initialized: {0}")]
    AlreadyInitialized(String),

    #[error("Session is not initialized")]
    NotInitialized,

    #[error("No current user")]
    NoCurrentUser,

    #[error("No peer connector configured")]
    NoPeerConnector,

    #[error("Session closed")]
    SessionClosed,
}

pub type VoiceResult<T> = Result<T, VoiceError>;
