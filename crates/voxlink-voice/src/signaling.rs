//! Signaling layer: session-lifecycle intents in, broadcast messages out.
//!
//! Every participant shares the topic, so every message reaches everyone.
//! Targeting is logical only: inbound routing drops our own echoes and
//! anything addressed to someone else. Malformed payloads are discarded.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use voxlink_protocol::{
    Envelope, IceCandidate, SessionDescription, SignalMessage, Topic, UserId,
};

use crate::error::{TransportError, VoiceResult};
use crate::events::VoiceMessageNotice;
use crate::guard::{Claim, ResourceGuard};
use crate::transport::{BroadcastTransport, Publisher, Subscription};

/// An inbound message relevant to the local participant
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Joined(UserId),
    Left(UserId),
    Offer {
        from: UserId,
        offer: SessionDescription,
    },
    /// `from` is absent when the sender did not identify itself
    Answer {
        from: Option<UserId>,
        answer: SessionDescription,
    },
    Candidate {
        from: UserId,
        candidate: IceCandidate,
    },
    AudioChunk {
        from: UserId,
        audio_data: String,
        timestamp: i64,
        seq: Option<u64>,
    },
    VoiceMessage(VoiceMessageNotice),
}

impl Inbound {
    /// The participant this message proves is alive, if known
    pub fn sender(&self) -> Option<&UserId> {
        match self {
            Inbound::Joined(u) | Inbound::Left(u) => Some(u),
            Inbound::Offer { from, .. }
            | Inbound::Candidate { from, .. }
            | Inbound::AudioChunk { from, .. } => Some(from),
            Inbound::Answer { from, .. } => from.as_ref(),
            Inbound::VoiceMessage(notice) => Some(&notice.sender_id),
        }
    }
}

fn addressed_elsewhere(to: Option<&UserId>, local: &UserId) -> bool {
    matches!(to, Some(target) if target != local)
}

/// Decide whether an envelope concerns `local`, and decode it if so.
pub fn route(local: &UserId, envelope: &Envelope) -> Option<Inbound> {
    let message = match SignalMessage::from_envelope(envelope) {
        Ok(message) => message,
        Err(e) => {
            warn!("Discarding signaling message: {e}");
            return None;
        }
    };

    let inbound = match message {
        SignalMessage::UserJoined { user_id } if &user_id != local => Inbound::Joined(user_id),
        SignalMessage::UserLeft { user_id } if &user_id != local => Inbound::Left(user_id),
        SignalMessage::Offer {
            offer,
            from_user_id,
            to_user_id,
        } if &from_user_id != local && !addressed_elsewhere(to_user_id.as_ref(), local) => {
            Inbound::Offer {
                from: from_user_id,
                offer,
            }
        }
        SignalMessage::Answer {
            answer,
            to_user_id,
            from_user_id,
        } if &to_user_id == local && from_user_id.as_ref() != Some(local) => Inbound::Answer {
            from: from_user_id,
            answer,
        },
        SignalMessage::IceCandidate {
            candidate,
            from_user_id,
            to_user_id,
        } if &from_user_id != local && !addressed_elsewhere(to_user_id.as_ref(), local) => {
            Inbound::Candidate {
                from: from_user_id,
                candidate,
            }
        }
        SignalMessage::AudioChunk {
            audio_data,
            user_id,
            timestamp,
            seq,
        } if &user_id != local => Inbound::AudioChunk {
            from: user_id,
            audio_data,
            timestamp,
            seq,
        },
        SignalMessage::VoiceMessage {
            message_id,
            sender_id,
            duration,
            timestamp,
        } => Inbound::VoiceMessage(VoiceMessageNotice {
            message_id,
            sender_id,
            duration,
            timestamp,
        }),
        other => {
            trace!("Ignoring {} not meant for {local}", other.kind().as_str());
            return None;
        }
    };

    Some(inbound)
}

/// The local participant's membership of one channel topic
pub struct SignalingChannel {
    subscription: Subscription,
    local: UserId,
    _claim: Claim,
}

impl SignalingChannel {
    /// Claim and join `topic` for `local`.
    pub async fn open(
        transport: Arc<dyn BroadcastTransport>,
        guard: &ResourceGuard,
        topic: &Topic,
        local: UserId,
        retry_backoff: Duration,
    ) -> VoiceResult<Self> {
        let name = topic.name();
        let claim = guard.claim_topic(&name, local.as_str())?;
        let subscription = Subscription::open(transport, name, retry_backoff).await?;
        Ok(Self {
            subscription,
            local,
            _claim: claim,
        })
    }

    pub fn topic(&self) -> &str {
        self.subscription.topic()
    }

    pub fn local(&self) -> &UserId {
        &self.local
    }

    pub fn publisher(&self) -> Publisher {
        self.subscription.publisher()
    }

    /// Broadcast our join; also used as the presence heartbeat
    pub async fn announce_presence(&self) -> Result<(), TransportError> {
        self.subscription
            .send_message(&SignalMessage::UserJoined {
                user_id: self.local.clone(),
            })
            .await
    }

    pub async fn announce_departure(&self) -> Result<(), TransportError> {
        self.subscription
            .send_message(&SignalMessage::UserLeft {
                user_id: self.local.clone(),
            })
            .await
    }

    pub async fn send_offer(
        &self,
        target: &UserId,
        offer: SessionDescription,
    ) -> Result<(), TransportError> {
        debug!("Sending offer to {target}");
        self.subscription
            .send_message(&SignalMessage::Offer {
                offer,
                from_user_id: self.local.clone(),
                to_user_id: Some(target.clone()),
            })
            .await
    }

    pub async fn send_answer(
        &self,
        target: &UserId,
        answer: SessionDescription,
    ) -> Result<(), TransportError> {
        debug!("Sending answer to {target}");
        self.subscription
            .send_message(&SignalMessage::Answer {
                answer,
                to_user_id: target.clone(),
                from_user_id: Some(self.local.clone()),
            })
            .await
    }

    pub async fn send_candidate(
        &self,
        target: &UserId,
        candidate: IceCandidate,
    ) -> Result<(), TransportError> {
        self.subscription
            .send_message(&SignalMessage::IceCandidate {
                candidate,
                from_user_id: self.local.clone(),
                to_user_id: Some(target.clone()),
            })
            .await
    }

    /// Next message meant for us; `None` once the subscription is gone.
    pub async fn next_inbound(&mut self) -> Option<Inbound> {
        while let Some(envelope) = self.subscription.recv().await {
            if let Some(inbound) = route(&self.local, &envelope) {
                return Some(inbound);
            }
        }
        None
    }

    /// Leave the topic and release the claim
    pub async fn close(self) {
        self.subscription.close().await;
    }
}
