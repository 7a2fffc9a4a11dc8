//! Peer media engine seam.
//!
//! The session manager drives negotiation; a connector owns the actual
//! media stack (SDP generation, network traversal, RTP).

use async_trait::async_trait;
use tokio::sync::mpsc;

use voxlink_protocol::{IceCandidate, PcmFrame, SessionDescription, UserId};

use crate::config::VoiceConfig;
use crate::error::NegotiationError;
use crate::media::{CaptureConstraints, LocalTrack};

/// Transport-level state reported by the media engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Identifies one connection among every connection a session creates.
///
/// A peer that renegotiates gets a new connection with a new id, so events
/// still in flight from the old one can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Asynchronous notifications from a peer connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A local network candidate was gathered and must be signaled
    LocalCandidate {
        peer: UserId,
        connection: ConnectionId,
        candidate: IceCandidate,
    },
    StateChanged {
        peer: UserId,
        connection: ConnectionId,
        state: MediaState,
    },
    /// The remote audio track became available
    RemoteTrack { peer: UserId, connection: ConnectionId },
    /// Decoded remote audio
    RemoteAudio {
        peer: UserId,
        connection: ConnectionId,
        frame: PcmFrame,
    },
}

impl ConnectionEvent {
    pub fn peer(&self) -> &UserId {
        match self {
            Self::LocalCandidate { peer, .. }
            | Self::StateChanged { peer, .. }
            | Self::RemoteTrack { peer, .. }
            | Self::RemoteAudio { peer, .. } => peer,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        match self {
            Self::LocalCandidate { connection, .. }
            | Self::StateChanged { connection, .. }
            | Self::RemoteTrack { connection, .. }
            | Self::RemoteAudio { connection, .. } => *connection,
        }
    }
}

pub type ConnectionEvents = mpsc::UnboundedSender<ConnectionEvent>;

/// Factory for per-peer connections
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    /// Microphone format the connector's outbound track expects
    fn capture_constraints(&self, config: &VoiceConfig) -> CaptureConstraints {
        CaptureConstraints::voice(config.sample_rate)
    }

    /// Create a connection to `peer` with the local track attached.
    /// Events for the connection are sent on `events`, tagged with `peer`
    /// and `connection`, including any reported while or after closing.
    async fn create(
        &self,
        peer: &UserId,
        connection: ConnectionId,
        local: LocalTrack,
        events: ConnectionEvents,
    ) -> Result<Box<dyn PeerConnection>, NegotiationError>;
}

/// One negotiated media session with a remote participant
#[async_trait]
pub trait PeerConnection: Send {
    /// Create an offer and install it as the local description
    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError>;

    /// Install a remote offer, then create and install the answer
    async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError>;

    /// Install the remote answer to our offer
    async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError>;

    /// Only valid once a remote description is installed
    async fn add_remote_candidate(&mut self, candidate: IceCandidate)
        -> Result<(), NegotiationError>;

    async fn close(&mut self);
}
