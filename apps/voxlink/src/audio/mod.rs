//! Audio capture and playback for the voice client.
//!
//! This module provides:
//! - Microphone capture (via cpal) behind the core's `MediaDevices` seam
//! - Speaker playback (via cpal) fed by a per-participant mixer
//! - Resampling between device rates and session rates (via rubato)

pub mod capture;
pub mod mixer;
pub mod playback;

pub use capture::CpalDevices;
pub use mixer::AudioMixer;
pub use playback::{AudioPlayback, MixerOutput};

/// Rate the mixer and the speaker run at
pub const PLAYBACK_SAMPLE_RATE: u32 = 48000;
/// Capture callback chunk, before resampling
pub const CAPTURE_CHUNK_MS: u32 = 20;

/// Audio device information
#[derive(Debug, Clone, serde::Serialize)]
pub struct AudioDevice {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}

/// Audio error type
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("Failed to initialize audio: {0}")]
    Init(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to build stream: {0}")]
    StreamBuild(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Resampling error: {0}")]
    Resample(String),
}

pub type AudioResult<T> = Result<T, AudioError>;

/// Convert between rates on a stream of mono samples.
///
/// Input is buffered until the resampler has a full chunk, so callers may
/// push any number of samples at a time.
pub struct RateConverter {
    resampler: rubato::FftFixedIn<f32>,
    pending: Vec<f32>,
    from: u32,
    to: u32,
}

impl RateConverter {
    pub fn new(from: u32, to: u32) -> AudioResult<Self> {
        let chunk = (from / 1000 * CAPTURE_CHUNK_MS).max(64) as usize;
        let resampler = rubato::FftFixedIn::<f32>::new(from as usize, to as usize, chunk, 1, 1)
            .map_err(|e| AudioError::Resample(format!("Failed to create resampler: {e}")))?;
        tracing::debug!("Created resampler: {} Hz -> {} Hz", from, to);
        Ok(Self {
            resampler,
            pending: Vec::with_capacity(chunk * 2),
            from,
            to,
        })
    }

    pub fn rates(&self) -> (u32, u32) {
        (self.from, self.to)
    }

    /// Feed samples, returning whatever full chunks produced
    pub fn process(&mut self, samples: &[f32]) -> AudioResult<Vec<f32>> {
        use rubato::Resampler;

        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let resampled = self
                .resampler
                .process(&[chunk], None)
                .map_err(|e| AudioError::Resample(e.to_string()))?;
            if let Some(channel) = resampled.into_iter().next() {
                out.extend(channel);
            }
        }
        Ok(out)
    }
}

pub fn to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

pub fn to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Average interleaved channels down to mono
pub fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|chunk| chunk.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Input and output devices of the default host
pub fn list_devices() -> AudioResult<(Vec<AudioDevice>, Vec<AudioDevice>)> {
    Ok((CpalDevices::list_devices()?, AudioPlayback::list_devices()?))
}
