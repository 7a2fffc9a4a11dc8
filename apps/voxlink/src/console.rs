//! Event sink for the terminal: events become JSON lines on stdout.

use std::sync::{Arc, Mutex};

use tracing::{trace, warn};

use voxlink_protocol::{PcmFrame, UserId};
use voxlink_voice::{VoiceEvent, VoiceEventHandler, VoiceMessageNotice};

use crate::audio::AudioMixer;

pub fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!("Cannot print event: {e}"),
    }
}

pub struct ConsoleHandler {
    mixer: Arc<Mutex<AudioMixer>>,
    /// Peer audio arrives here and must be mixed; fallback audio is mixed
    /// by the playback queue's output instead.
    mix_live_audio: bool,
}

impl ConsoleHandler {
    pub fn new(mixer: Arc<Mutex<AudioMixer>>, mix_live_audio: bool) -> Self {
        Self {
            mixer,
            mix_live_audio,
        }
    }
}

impl VoiceEventHandler for ConsoleHandler {
    fn on_audio_received(&self, from: &UserId, frame: &PcmFrame) {
        trace!("{} samples from {from}", frame.samples.len());
        if !self.mix_live_audio {
            return;
        }
        match self.mixer.lock() {
            Ok(mut mixer) => mixer.push_frame(from, frame),
            Err(_) => warn!("Mixer poisoned, dropping audio from {from}"),
        }
    }

    fn on_remote_track(&self, peer: &UserId) {
        print_json(&VoiceEvent::RemoteTrack { peer: peer.clone() });
    }

    fn on_peer_joined(&self, peer: &UserId) {
        print_json(&VoiceEvent::PeerJoined { peer: peer.clone() });
    }

    fn on_peer_left(&self, peer: &UserId) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.remove_source(peer);
        }
        print_json(&VoiceEvent::PeerLeft { peer: peer.clone() });
    }

    fn on_voice_message(&self, notice: &VoiceMessageNotice) {
        print_json(&VoiceEvent::VoiceMessage(notice.clone()));
    }
}
