//! Stored voice messages: recording, and the request handed to the relay.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use voxlink_protocol::codec::{encode_fragment, to_transport};
use voxlink_protocol::{AudioCodec, ChannelId, PcmFrame, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    Idle,
    Recording,
    Paused,
    Finished,
}

impl std::fmt::Display for RecorderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Paused => "paused",
            Self::Finished => "finished",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecorderError {
    #[error("Cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: RecorderState,
    },

    #[error("Nothing was recorded")]
    Empty,

    #[error("Frame format {got_rate} Hz/{got_channels} ch does not match {rate} Hz/{channels} ch")]
    FormatMismatch {
        rate: u32,
        channels: u8,
        got_rate: u32,
        got_channels: u8,
    },
}

pub type RecorderResult<T> = Result<T, RecorderError>;

/// Records captured frames into a voice message.
///
/// `Idle -> Recording <-> Paused -> Finished`. Frames pushed while paused are
/// discarded; the duration counts recorded samples only.
pub struct VoiceMessageRecorder {
    sender: UserId,
    sample_rate: u32,
    channels: u8,
    state: RecorderState,
    samples: Vec<i16>,
}

impl VoiceMessageRecorder {
    pub fn new(sender: UserId, sample_rate: u32, channels: u8) -> Self {
        Self {
            sender,
            sample_rate,
            channels: channels.max(1),
            state: RecorderState::Idle,
            samples: Vec::new(),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    fn transition(
        &mut self,
        action: &'static str,
        from: &[RecorderState],
        to: RecorderState,
    ) -> RecorderResult<()> {
        if !from.contains(&self.state) {
            return Err(RecorderError::InvalidTransition {
                action,
                state: self.state,
            });
        }
        debug!("Recorder {} -> {to}", self.state);
        self.state = to;
        Ok(())
    }

    pub fn start(&mut self) -> RecorderResult<()> {
        self.transition("start", &[RecorderState::Idle], RecorderState::Recording)
    }

    pub fn pause(&mut self) -> RecorderResult<()> {
        self.transition("pause", &[RecorderState::Recording], RecorderState::Paused)
    }

    pub fn resume(&mut self) -> RecorderResult<()> {
        self.transition("resume", &[RecorderState::Paused], RecorderState::Recording)
    }

    /// Append a frame. Returns whether it was kept.
    pub fn push(&mut self, frame: &PcmFrame) -> RecorderResult<bool> {
        if frame.sample_rate != self.sample_rate || frame.channels != self.channels {
            return Err(RecorderError::FormatMismatch {
                rate: self.sample_rate,
                channels: self.channels,
                got_rate: frame.sample_rate,
                got_channels: frame.channels,
            });
        }
        if self.state != RecorderState::Recording {
            return Ok(false);
        }
        self.samples.extend_from_slice(&frame.samples);
        Ok(true)
    }

    /// Recorded length in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        let frames = self.samples.len() / self.channels as usize;
        frames as f64 / self.sample_rate as f64
    }

    /// Discard everything and go back to idle
    pub fn cancel(&mut self) {
        self.samples.clear();
        self.state = RecorderState::Idle;
    }

    /// Close the recording and package it
    pub fn finish(&mut self) -> RecorderResult<VoiceMessageDraft> {
        if !matches!(self.state, RecorderState::Recording | RecorderState::Paused) {
            return Err(RecorderError::InvalidTransition {
                action: "finish",
                state: self.state,
            });
        }
        if self.samples.is_empty() {
            return Err(RecorderError::Empty);
        }

        let duration = self.duration();
        let frame = PcmFrame::new(
            self.sample_rate,
            self.channels,
            std::mem::take(&mut self.samples),
        );
        self.state = RecorderState::Finished;

        let draft = VoiceMessageDraft {
            id: Uuid::new_v4(),
            sender: self.sender.clone(),
            duration,
            payload: encode_fragment(&frame, AudioCodec::Pcm16),
        };
        info!("Recorded voice message {} ({})", draft.id, format_duration(duration));
        Ok(draft)
    }
}

/// Where a voice message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceMessageTarget {
    Channel(ChannelId),
    User(UserId),
}

/// A finished recording, not yet sent
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceMessageDraft {
    pub id: Uuid,
    pub sender: UserId,
    /// Seconds
    pub duration: f64,
    /// Fragment container bytes
    pub payload: Vec<u8>,
}

impl VoiceMessageDraft {
    pub fn to_request(&self, target: &VoiceMessageTarget) -> SendVoiceMessageRequest {
        let (recipient_id, channel_id) = match target {
            VoiceMessageTarget::Channel(c) => (None, Some(c.clone())),
            VoiceMessageTarget::User(u) => (Some(u.clone()), None),
        };
        SendVoiceMessageRequest {
            audio_data: to_transport(&self.payload),
            duration: self.duration,
            recipient_id,
            channel_id,
            sender_id: self.sender.clone(),
        }
    }
}

/// Body posted to the relay's `send-voice-message` function
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendVoiceMessageRequest {
    pub audio_data: String,
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    pub sender_id: UserId,
}

/// Relay reply: `{success, messageId}` or `{error}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendVoiceMessageReceipt {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Relay request failed: {0}")]
    Request(String),

    #[error("Relay rejected the message: {0}")]
    Rejected(String),
}

/// Stores a voice message and notifies its recipients
#[async_trait]
pub trait VoiceMessageRelay: Send + Sync {
    async fn send(
        &self,
        request: &SendVoiceMessageRequest,
    ) -> Result<SendVoiceMessageReceipt, RelayError>;
}

/// Render seconds as `m:ss`
pub fn format_duration(secs: f64) -> String {
    let total = if secs.is_finite() && secs > 0.0 {
        secs.floor() as u64
    } else {
        0
    };
    format!("{}:{:02}", total / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxlink_protocol::codec::decode_fragment;

    fn frame(len: usize) -> PcmFrame {
        PcmFrame::new(8000, 1, vec![100; len])
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.0), "0:00");
        assert_eq!(format_duration(5.9), "0:05");
        assert_eq!(format_duration(65.0), "1:05");
        assert_eq!(format_duration(600.2), "10:00");
        assert_eq!(format_duration(-3.0), "0:00");
        assert_eq!(format_duration(f64::NAN), "0:00");
    }

    #[test]
    fn test_paused_frames_are_not_recorded() {
        let mut recorder = VoiceMessageRecorder::new("userX".into(), 8000, 1);
        assert!(!recorder.push(&frame(8000)).unwrap());

        recorder.start().unwrap();
        assert!(recorder.push(&frame(8000)).unwrap());
        recorder.pause().unwrap();
        assert!(!recorder.push(&frame(8000)).unwrap());
        recorder.resume().unwrap();
        assert!(recorder.push(&frame(4000)).unwrap());

        assert!((recorder.duration() - 1.5).abs() < 1e-9);

        let draft = recorder.finish().unwrap();
        assert_eq!(recorder.state(), RecorderState::Finished);
        assert!((draft.duration - 1.5).abs() < 1e-9);
        assert_eq!(decode_fragment(&draft.payload).unwrap().samples.len(), 12000);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut recorder = VoiceMessageRecorder::new("userX".into(), 8000, 1);
        assert!(matches!(
            recorder.pause(),
            Err(RecorderError::InvalidTransition { action: "pause", state: RecorderState::Idle })
        ));
        assert!(recorder.finish().is_err());

        recorder.start().unwrap();
        assert!(recorder.start().is_err());
        assert_eq!(recorder.finish(), Err(RecorderError::Empty));

        recorder.cancel();
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert!(recorder.push(&PcmFrame::new(48000, 1, vec![0; 10])).is_err());
    }

    #[test]
    fn test_request_shape() {
        let draft = VoiceMessageDraft {
            id: Uuid::nil(),
            sender: "userX".into(),
            duration: 2.0,
            payload: vec![1, 2, 3],
        };
        let request = draft.to_request(&VoiceMessageTarget::Channel("room".into()));
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "audioData": "AQID",
                "duration": 2.0,
                "channelId": "room",
                "senderId": "userX"
            })
        );

        let receipt: SendVoiceMessageReceipt =
            serde_json::from_str(r#"{"success":true,"messageId":"m1","message":"ok"}"#).unwrap();
        assert_eq!(receipt.message_id.as_deref(), Some("m1"));
        let failure: SendVoiceMessageReceipt =
            serde_json::from_str(r#"{"error":"Audio data and sender ID are required"}"#).unwrap();
        assert!(!failure.success);
    }
}
