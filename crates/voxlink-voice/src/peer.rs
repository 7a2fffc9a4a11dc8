//! Per-peer negotiation state.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use voxlink_protocol::{IceCandidate, SessionDescription, UserId};

use crate::connector::{ConnectionId, PeerConnection};
use crate::error::NegotiationError;

/// Remote candidates held per peer before its remote description arrives
pub const MAX_PENDING_CANDIDATES: usize = 32;

/// Negotiation state of one remote participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Known, no connection negotiated yet
    New,
    /// We offered and are waiting for the answer
    OfferSent,
    /// We answered a remote offer; waiting for media
    AnswerSent,
    /// The remote answered our offer; waiting for media
    AnswerReceived,
    /// Media is flowing
    Connected,
    /// Torn down. Terminal.
    Closed,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::OfferSent => "offer-sent",
            Self::AnswerSent => "answer-sent",
            Self::AnswerReceived => "answer-received",
            Self::Connected => "connected",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Inputs that move a peer between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTransition {
    SendOffer,
    AnswerOffer,
    ReceiveAnswer,
    MediaConnected,
    Close,
}

impl std::fmt::Display for PeerTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SendOffer => "offer",
            Self::AnswerOffer => "remote offer",
            Self::ReceiveAnswer => "answer",
            Self::MediaConnected => "media connected",
            Self::Close => "close",
        };
        f.write_str(s)
    }
}

impl PeerState {
    /// Apply a transition, rejecting anything the state machine does not allow
    pub fn apply(self, transition: PeerTransition) -> Result<PeerState, NegotiationError> {
        use PeerState::*;
        use PeerTransition::*;

        match (self, transition) {
            (_, Close) => Ok(Closed),
            (New, SendOffer) => Ok(OfferSent),
            (New, AnswerOffer) => Ok(AnswerSent),
            (OfferSent, ReceiveAnswer) => Ok(AnswerReceived),
            (AnswerSent | AnswerReceived | Connected, MediaConnected) => Ok(Connected),
            (state, transition) => Err(NegotiationError::UnexpectedMessage {
                message: transition.to_string(),
                state: state.to_string(),
            }),
        }
    }

    pub fn is_negotiating(&self) -> bool {
        matches!(self, Self::OfferSent | Self::AnswerSent | Self::AnswerReceived)
    }
}

/// A remote participant and its connection
pub struct Peer {
    user: UserId,
    state: PeerState,
    state_since: Instant,
    connection: Option<Box<dyn PeerConnection>>,
    connection_id: Option<ConnectionId>,
    has_remote_description: bool,
    pending_candidates: Vec<IceCandidate>,
    remote_track: bool,
}

impl Peer {
    pub fn new(user: UserId, now: Instant) -> Self {
        Self {
            user,
            state: PeerState::New,
            state_since: now,
            connection: None,
            connection_id: None,
            has_remote_description: false,
            pending_candidates: Vec::new(),
            remote_track: false,
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// When the current state was entered
    pub fn state_since(&self) -> Instant {
        self.state_since
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn attach(&mut self, id: ConnectionId, connection: Box<dyn PeerConnection>) {
        self.connection = Some(connection);
        self.connection_id = Some(id);
    }

    /// Whether `id` is the live connection of this peer
    pub fn owns(&self, id: ConnectionId) -> bool {
        self.connection.is_some() && self.connection_id == Some(id)
    }

    /// Record the remote track; returns true the first time only
    pub fn mark_remote_track(&mut self) -> bool {
        !std::mem::replace(&mut self.remote_track, true)
    }

    pub fn transition(
        &mut self,
        transition: PeerTransition,
        now: Instant,
    ) -> Result<PeerState, NegotiationError> {
        let next = self.state.apply(transition)?;
        if next != self.state {
            debug!("Peer {}: {} -> {} ({transition})", self.user, self.state, next);
            self.state = next;
            self.state_since = now;
        }
        Ok(next)
    }

    fn connection(&mut self) -> Result<&mut Box<dyn PeerConnection>, NegotiationError> {
        self.connection
            .as_mut()
            .ok_or_else(|| NegotiationError::Engine(format!("no connection to {}", self.user)))
    }

    /// Create and install our offer. Moves New -> OfferSent.
    pub async fn offer(&mut self, now: Instant) -> Result<SessionDescription, NegotiationError> {
        self.state.apply(PeerTransition::SendOffer)?;
        let offer = self.connection()?.create_offer().await?;
        self.transition(PeerTransition::SendOffer, now)?;
        Ok(offer)
    }

    /// Answer a remote offer. Moves New -> AnswerSent and applies buffered candidates.
    pub async fn answer(
        &mut self,
        offer: SessionDescription,
        now: Instant,
    ) -> Result<SessionDescription, NegotiationError> {
        self.state.apply(PeerTransition::AnswerOffer)?;
        let answer = self.connection()?.accept_offer(offer).await?;
        self.has_remote_description = true;
        self.transition(PeerTransition::AnswerOffer, now)?;
        self.flush_candidates().await?;
        Ok(answer)
    }

    /// Apply the remote answer. Moves OfferSent -> AnswerReceived and applies buffered candidates.
    pub async fn accept_answer(
        &mut self,
        answer: SessionDescription,
        now: Instant,
    ) -> Result<(), NegotiationError> {
        self.state.apply(PeerTransition::ReceiveAnswer)?;
        self.connection()?.apply_answer(answer).await?;
        self.has_remote_description = true;
        self.transition(PeerTransition::ReceiveAnswer, now)?;
        self.flush_candidates().await
    }

    /// Apply a remote candidate now, or hold it until the remote description is installed
    pub async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if self.has_remote_description {
            if let Some(connection) = self.connection.as_mut() {
                return connection.add_remote_candidate(candidate).await;
            }
        }
        if self.pending_candidates.len() >= MAX_PENDING_CANDIDATES {
            warn!("Too many early candidates from {}, dropping one", self.user);
            return Ok(());
        }
        debug!(
            "Buffering candidate for {} ({} pending)",
            self.user,
            self.pending_candidates.len() + 1
        );
        self.pending_candidates.push(candidate);
        Ok(())
    }

    async fn flush_candidates(&mut self) -> Result<(), NegotiationError> {
        if self.pending_candidates.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending_candidates);
        info!("Applying {} buffered candidates for {}", pending.len(), self.user);
        let connection = self.connection()?;
        for candidate in pending {
            if let Err(e) = connection.add_remote_candidate(candidate).await {
                // One unusable path does not doom the connection
                warn!("Dropping buffered candidate: {e}");
            }
        }
        Ok(())
    }

    /// Close the connection and move to Closed
    pub async fn close(&mut self, now: Instant) {
        self.connection_id = None;
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
        self.pending_candidates.clear();
        let _ = self.transition(PeerTransition::Close, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_offer_path() {
        let s = PeerState::New;
        let s = s.apply(PeerTransition::SendOffer).unwrap();
        let s = s.apply(PeerTransition::ReceiveAnswer).unwrap();
        assert_eq!(s, PeerState::AnswerReceived);
        assert_eq!(s.apply(PeerTransition::MediaConnected).unwrap(), PeerState::Connected);
    }

    #[test]
    fn test_answer_path() {
        let s = PeerState::New.apply(PeerTransition::AnswerOffer).unwrap();
        assert_eq!(s, PeerState::AnswerSent);
        assert_eq!(s.apply(PeerTransition::MediaConnected).unwrap(), PeerState::Connected);
    }

    #[test]
    fn test_rejects_invalid_transitions() {
        assert!(PeerState::New.apply(PeerTransition::ReceiveAnswer).is_err());
        assert!(PeerState::New.apply(PeerTransition::MediaConnected).is_err());
        assert!(PeerState::AnswerSent.apply(PeerTransition::ReceiveAnswer).is_err());
        assert!(PeerState::Connected.apply(PeerTransition::SendOffer).is_err());
        assert!(PeerState::Closed.apply(PeerTransition::MediaConnected).is_err());
        assert_eq!(
            PeerState::Connected.apply(PeerTransition::Close).unwrap(),
            PeerState::Closed
        );
        assert_eq!(PeerState::Closed.apply(PeerTransition::Close).unwrap(), PeerState::Closed);
    }

    #[derive(Default)]
    struct Recorded {
        candidates: Vec<String>,
        closed: bool,
    }

    struct RecordingConnection(Arc<Mutex<Recorded>>);

    #[async_trait]
    impl PeerConnection for RecordingConnection {
        async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
            Ok(SessionDescription::offer("v=0 offer"))
        }

        async fn accept_offer(
            &mut self,
            _offer: SessionDescription,
        ) -> Result<SessionDescription, NegotiationError> {
            Ok(SessionDescription::answer("v=0 answer"))
        }

        async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
            if answer.sdp.is_empty() {
                return Err(NegotiationError::InvalidDescription("empty".into()));
            }
            Ok(())
        }

        async fn add_remote_candidate(
            &mut self,
            candidate: IceCandidate,
        ) -> Result<(), NegotiationError> {
            self.0.lock().unwrap().candidates.push(candidate.candidate);
            Ok(())
        }

        async fn close(&mut self) {
            self.0.lock().unwrap().closed = true;
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n}"),
            sdp_mid: None,
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn test_early_candidates_are_buffered_then_applied() {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let now = Instant::now();
        let mut peer = Peer::new("userY".into(), now);

        peer.add_candidate(candidate(1)).await.unwrap();
        assert_eq!(peer.pending_candidates(), 1);

        peer.attach(ConnectionId(1), Box::new(RecordingConnection(recorded.clone())));
        peer.add_candidate(candidate(2)).await.unwrap();
        assert_eq!(peer.pending_candidates(), 2);
        assert!(recorded.lock().unwrap().candidates.is_empty());

        peer.answer(SessionDescription::offer("v=0"), now).await.unwrap();
        assert_eq!(peer.state(), PeerState::AnswerSent);
        assert_eq!(peer.pending_candidates(), 0);

        peer.add_candidate(candidate(3)).await.unwrap();
        assert_eq!(
            recorded.lock().unwrap().candidates,
            vec!["candidate:1", "candidate:2", "candidate:3"]
        );
    }

    #[tokio::test]
    async fn test_failed_answer_keeps_state() {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let now = Instant::now();
        let mut peer = Peer::new("userY".into(), now);
        peer.attach(ConnectionId(1), Box::new(RecordingConnection(recorded.clone())));

        peer.offer(now).await.unwrap();
        let result = peer.accept_answer(SessionDescription::answer(""), now).await;
        assert!(matches!(result, Err(NegotiationError::InvalidDescription(_))));
        assert_eq!(peer.state(), PeerState::OfferSent);

        assert!(peer.owns(ConnectionId(1)));
        peer.close(now).await;
        assert_eq!(peer.state(), PeerState::Closed);
        assert!(recorded.lock().unwrap().closed);
        assert!(!peer.owns(ConnectionId(1)));
    }

    #[tokio::test]
    async fn test_early_candidates_are_capped() {
        let now = Instant::now();
        let mut peer = Peer::new("stray".into(), now);
        for n in 0..(MAX_PENDING_CANDIDATES as u32 + 10) {
            peer.add_candidate(candidate(n)).await.unwrap();
        }
        assert_eq!(peer.pending_candidates(), MAX_PENDING_CANDIDATES);
    }
}
