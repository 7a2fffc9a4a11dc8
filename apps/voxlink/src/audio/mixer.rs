//! Audio mixer for combining multiple audio sources.
//!
//! Every participant heard in a channel gets its own source buffer; the
//! speaker callback pulls one mixed stream out of all of them.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::{debug, warn};

use voxlink_protocol::codec::is_supported_format;
use voxlink_protocol::{PcmFrame, UserId};

use super::{downmix, to_f32, to_i16, RateConverter};

/// Maximum buffered audio per source (to handle jitter)
const MAX_BUFFER_MS: usize = 400;

/// Audio source representing one participant's audio stream
struct AudioSource {
    /// Ring buffer of PCM samples
    buffer: VecDeque<i16>,
    capacity: usize,
    /// Converter from the participant's rate, created on first mismatch
    resampler: Option<RateConverter>,
    /// Running average for audio level calculation
    level_accumulator: f32,
    level_sample_count: usize,
}

impl AudioSource {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            resampler: None,
            level_accumulator: 0.0,
            level_sample_count: 0,
        }
    }

    fn push_samples(&mut self, samples: &[i16]) {
        for &sample in samples {
            // Evict old samples if buffer is full
            if self.buffer.len() >= self.capacity {
                self.buffer.pop_front();
            }
            self.buffer.push_back(sample);

            let abs_sample = (sample as f32).abs() / 32768.0;
            self.level_accumulator += abs_sample;
            self.level_sample_count += 1;
        }
    }

    fn get_samples(&mut self, count: usize) -> Vec<i16> {
        let available = self.buffer.len().min(count);
        let mut result: Vec<i16> = self.buffer.drain(..available).collect();
        // Pad with silence if not enough samples
        result.resize(count, 0);
        result
    }

    /// Current audio level (0.0 - 1.0), reset on read
    fn get_level(&mut self) -> f32 {
        if self.level_sample_count == 0 {
            return 0.0;
        }

        let level = self.level_accumulator / self.level_sample_count as f32;
        self.level_accumulator = 0.0;
        self.level_sample_count = 0;

        (level * 3.0).min(1.0)
    }
}

/// Audio mixer that combines multiple audio sources into one output stream.
pub struct AudioMixer {
    sources: HashMap<UserId, AudioSource>,
    /// Output sample rate
    sample_rate: u32,
    /// Whether mixer is muted (deafened)
    muted: bool,
}

impl AudioMixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sources: HashMap::new(),
            sample_rate,
            muted: false,
        }
    }

    /// Push a decoded frame from a participant, converting it to the
    /// mixer's mono rate first.
    pub fn push_frame(&mut self, from: &UserId, frame: &PcmFrame) {
        if !is_supported_format(frame.sample_rate, frame.channels) {
            warn!(
                "Dropping audio from {from}: {} Hz / {} channels",
                frame.sample_rate, frame.channels
            );
            return;
        }
        let capacity = self.sample_rate as usize * MAX_BUFFER_MS / 1000;
        let source = self
            .sources
            .entry(from.clone())
            .or_insert_with(|| AudioSource::new(capacity));

        if frame.sample_rate == self.sample_rate && frame.channels <= 1 {
            source.push_samples(&frame.samples);
            return;
        }

        let mono: Vec<f32> = downmix(
            &frame.samples.iter().map(|&s| to_f32(s)).collect::<Vec<_>>(),
            frame.channels as usize,
        );
        if frame.sample_rate == self.sample_rate {
            let pcm: Vec<i16> = mono.iter().map(|&s| to_i16(s)).collect();
            source.push_samples(&pcm);
            return;
        }

        let stale = source
            .resampler
            .as_ref()
            .map(|r| r.rates() != (frame.sample_rate, self.sample_rate))
            .unwrap_or(true);
        if stale {
            match RateConverter::new(frame.sample_rate, self.sample_rate) {
                Ok(r) => source.resampler = Some(r),
                Err(e) => {
                    warn!("Dropping audio from {from}: {e}");
                    return;
                }
            }
        }
        let Some(resampler) = source.resampler.as_mut() else {
            return;
        };
        match resampler.process(&mono) {
            Ok(out) => {
                let pcm: Vec<i16> = out.iter().map(|&s| to_i16(s)).collect();
                source.push_samples(&pcm);
            }
            Err(e) => warn!("Dropping audio from {from}: {e}"),
        }
    }

    /// Get mixed audio for playback
    ///
    /// Returns `sample_count` samples of mixed audio from all sources.
    pub fn get_mixed_output(&mut self, sample_count: usize) -> Vec<i16> {
        if self.muted || self.sources.is_empty() {
            return vec![0i16; sample_count];
        }

        let source_count = self.sources.len();
        let mut mixed = vec![0i32; sample_count];
        for source in self.sources.values_mut() {
            for (i, sample) in source.get_samples(sample_count).into_iter().enumerate() {
                mixed[i] += sample as i32;
            }
        }

        // Simple averaging to prevent clipping
        let divisor = source_count.max(1) as i32;
        mixed
            .into_iter()
            .map(|s| (s / divisor).clamp(-32768, 32767) as i16)
            .collect()
    }

    pub fn remove_source(&mut self, from: &UserId) {
        if self.sources.remove(from).is_some() {
            debug!("Removed audio source for {from}");
        }
    }

    /// Levels of every source, reset on read
    pub fn levels(&mut self) -> BTreeMap<UserId, f32> {
        self.sources
            .iter_mut()
            .map(|(user, source)| (user.clone(), source.get_level()))
            .collect()
    }

    /// Set muted state (deafen)
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn clear(&mut self) {
        self.sources.clear();
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::from(id)
    }

    #[test]
    fn test_mixer_empty() {
        let mut mixer = AudioMixer::new(48000);
        let output = mixer.get_mixed_output(960);
        assert_eq!(output.len(), 960);
        assert!(output.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_mixer_single_source() {
        let mut mixer = AudioMixer::new(48000);
        let samples: Vec<i16> = (0..960).map(|i| (i % 100) as i16).collect();
        mixer.push_frame(&user("a"), &PcmFrame::new(48000, 1, samples.clone()));

        let output = mixer.get_mixed_output(960);
        assert_eq!(output, samples);
    }

    #[test]
    fn test_mixer_multiple_sources() {
        let mut mixer = AudioMixer::new(48000);
        mixer.push_frame(&user("a"), &PcmFrame::new(48000, 1, vec![100; 960]));
        mixer.push_frame(&user("b"), &PcmFrame::new(48000, 1, vec![100; 960]));

        let output = mixer.get_mixed_output(960);
        // Average of two 100s is 100
        assert!(output.iter().all(|&s| s == 100));
        assert_eq!(mixer.levels().len(), 2);
    }

    #[test]
    fn test_mixer_muted() {
        let mut mixer = AudioMixer::new(48000);
        mixer.push_frame(&user("a"), &PcmFrame::new(48000, 1, vec![1000; 960]));
        mixer.set_muted(true);

        let output = mixer.get_mixed_output(960);
        assert!(output.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_mixer_converts_narrowband_sources() {
        let mut mixer = AudioMixer::new(48000);
        // One second of 8 kHz audio fills the source buffer
        mixer.push_frame(&user("a"), &PcmFrame::new(8000, 1, vec![0; 8000]));
        let output = mixer.get_mixed_output(480);
        assert_eq!(output.len(), 480);

        mixer.remove_source(&user("a"));
        assert!(mixer.levels().is_empty());
    }

    #[test]
    fn test_mixer_ignores_unplayable_rates() {
        let mut mixer = AudioMixer::new(48000);
        mixer.push_frame(&user("a"), &PcmFrame::new(4_294_967_291, 1, vec![1000; 960]));
        assert!(mixer.levels().is_empty());
        assert!(mixer.get_mixed_output(960).iter().all(|&s| s == 0));
    }

    #[test]
    fn test_buffer_is_bounded() {
        let mut mixer = AudioMixer::new(48000);
        mixer.push_frame(&user("a"), &PcmFrame::new(48000, 1, vec![1; 48000]));
        let cap = 48000 * MAX_BUFFER_MS / 1000;
        let drained = mixer.get_mixed_output(48000);
        assert_eq!(drained.iter().filter(|&&s| s == 1).count(), cap);
    }
}
