//! Callbacks surfaced to the UI layer.

use tokio::sync::mpsc;
use tracing::error;

use voxlink_protocol::{PcmFrame, UserId};

/// Trait for handling voice session events. Implement this to wire playback
/// and presence UI.
pub trait VoiceEventHandler: Send + Sync + 'static {
    /// Called with decoded audio from a remote participant.
    ///
    /// # Arguments
    /// * `from` - The participant who produced the audio
    /// * `frame` - Interleaved PCM samples
    fn on_audio_received(&self, from: &UserId, frame: &PcmFrame);

    /// Called once when a peer connection's remote audio track becomes available.
    fn on_remote_track(&self, peer: &UserId);

    /// Called when a participant enters the connected set.
    fn on_peer_joined(&self, peer: &UserId);

    /// Called when a participant leaves the connected set (explicit leave or eviction).
    fn on_peer_left(&self, peer: &UserId);

    /// Called when a stored voice message is announced.
    fn on_voice_message(&self, notice: &VoiceMessageNotice);
}

/// Announcement of a stored voice message
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct VoiceMessageNotice {
    pub message_id: String,
    pub sender_id: UserId,
    pub duration: f64,
    pub timestamp: String,
}

/// Voice event forwarded to a channel consumer
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "type", content = "data")]
pub enum VoiceEvent {
    AudioReceived {
        from: UserId,
        sample_rate: u32,
        channels: u8,
        samples: usize,
    },
    RemoteTrack {
        peer: UserId,
    },
    PeerJoined {
        peer: UserId,
    },
    PeerLeft {
        peer: UserId,
    },
    VoiceMessage(VoiceMessageNotice),
}

/// Handler that forwards every callback into an mpsc channel.
///
/// Audio payloads are summarized, not copied; wire a dedicated handler for
/// playback.
pub struct ChannelEventHandler {
    tx: mpsc::UnboundedSender<VoiceEvent>,
}

impl ChannelEventHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<VoiceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: VoiceEvent) {
        if self.tx.send(event).is_err() {
            error!("Voice event receiver dropped");
        }
    }
}

impl VoiceEventHandler for ChannelEventHandler {
    fn on_audio_received(&self, from: &UserId, frame: &PcmFrame) {
        self.emit(VoiceEvent::AudioReceived {
            from: from.clone(),
            sample_rate: frame.sample_rate,
            channels: frame.channels,
            samples: frame.samples.len(),
        });
    }

    fn on_remote_track(&self, peer: &UserId) {
        self.emit(VoiceEvent::RemoteTrack { peer: peer.clone() });
    }

    fn on_peer_joined(&self, peer: &UserId) {
        self.emit(VoiceEvent::PeerJoined { peer: peer.clone() });
    }

    fn on_peer_left(&self, peer: &UserId) {
        self.emit(VoiceEvent::PeerLeft { peer: peer.clone() });
    }

    fn on_voice_message(&self, notice: &VoiceMessageNotice) {
        self.emit(VoiceEvent::VoiceMessage(notice.clone()));
    }
}
