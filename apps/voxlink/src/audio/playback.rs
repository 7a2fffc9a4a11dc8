//! Audio playback to speakers using cpal.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleFormat, Stream, StreamConfig};
use tracing::{debug, error, info};

use voxlink_protocol::{PcmFrame, UserId};
use voxlink_voice::{AudioOutput, PlaybackError};

use super::mixer::AudioMixer;
use super::{AudioDevice, AudioError, AudioResult, PLAYBACK_SAMPLE_RATE};

/// Audio playback to speakers.
/// Plays audio from the mixer which combines multiple sources.
///
/// The cpal stream lives on its own thread; dropping this handle stops it.
pub struct AudioPlayback {
    running: Arc<AtomicBool>,
    stop: Option<std_mpsc::Sender<()>>,
}

impl AudioPlayback {
    /// Start audio playback on a specific device (or default if None).
    pub fn start(device_id: Option<String>, mixer: Arc<Mutex<AudioMixer>>) -> AudioResult<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread_running = running.clone();
        thread::Builder::new()
            .name("voxlink-playback".into())
            .spawn(move || {
                match Self::open(device_id.as_deref(), mixer, thread_running) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        let _ = stop_rx.recv();
                        drop(stream);
                        info!("Audio playback stopped");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| AudioError::Init(format!("Failed to spawn playback thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| AudioError::Init("Playback thread exited".into()))??;

        Ok(Self {
            running,
            stop: Some(stop_tx),
        })
    }

    fn open(
        device_id: Option<&str>,
        mixer: Arc<Mutex<AudioMixer>>,
        running: Arc<AtomicBool>,
    ) -> AudioResult<Stream> {
        let host = cpal::default_host();
        debug!("Got cpal host: {:?}", host.id());

        let device = match device_id {
            Some(id) => Self::find_device(&host, id)?,
            None => host
                .default_output_device()
                .ok_or_else(|| AudioError::DeviceNotFound("No default output device".into()))?,
        };

        let device_name = device.name().unwrap_or_else(|_| "Unknown".into());
        info!("Starting audio playback on: {}", device_name);

        // Try to use the mixer rate if supported, otherwise use default
        let supported_configs = device
            .supported_output_configs()
            .map_err(|e| AudioError::Init(format!("Failed to get output configs: {e}")))?;

        let mut selected_config = None;
        for config_range in supported_configs {
            if config_range.min_sample_rate().0 <= PLAYBACK_SAMPLE_RATE
                && config_range.max_sample_rate().0 >= PLAYBACK_SAMPLE_RATE
            {
                selected_config =
                    Some(config_range.with_sample_rate(cpal::SampleRate(PLAYBACK_SAMPLE_RATE)));
                break;
            }
        }

        let supported_config = match selected_config {
            Some(config) => config,
            None => device
                .default_output_config()
                .map_err(|e| AudioError::Init(format!("Failed to get output config: {e}")))?,
        };

        let sample_format = supported_config.sample_format();
        let config: StreamConfig = supported_config.into();
        let output_channels = config.channels as usize;

        debug!(
            "Output config: {} Hz, {} channels, {:?}",
            config.sample_rate.0, output_channels, sample_format
        );

        let stream = match sample_format {
            SampleFormat::F32 => {
                Self::build_stream::<f32>(&device, &config, mixer, running, output_channels)?
            }
            SampleFormat::I16 => {
                Self::build_stream::<i16>(&device, &config, mixer, running, output_channels)?
            }
            SampleFormat::U16 => {
                Self::build_stream::<u16>(&device, &config, mixer, running, output_channels)?
            }
            SampleFormat::I32 => {
                Self::build_stream::<i32>(&device, &config, mixer, running, output_channels)?
            }
            SampleFormat::F64 => {
                Self::build_stream::<f64>(&device, &config, mixer, running, output_channels)?
            }
            _ => {
                return Err(AudioError::Init(format!(
                    "Unsupported sample format: {:?}",
                    sample_format
                )));
            }
        };

        stream
            .play()
            .map_err(|e| AudioError::Stream(format!("Failed to start stream: {e}")))?;

        info!(
            "Audio playback started on device: {}, sample_rate: {}, channels: {}",
            device_name, config.sample_rate.0, output_channels
        );
        Ok(stream)
    }

    fn find_device(host: &Host, device_id: &str) -> AudioResult<Device> {
        let devices = host
            .output_devices()
            .map_err(|e| AudioError::Init(format!("Failed to enumerate devices: {e}")))?;

        for device in devices {
            if let Ok(name) = device.name() {
                if name == device_id {
                    return Ok(device);
                }
            }
        }

        Err(AudioError::DeviceNotFound(device_id.to_string()))
    }

    fn build_stream<T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32> + Send + 'static>(
        device: &Device,
        config: &StreamConfig,
        mixer: Arc<Mutex<AudioMixer>>,
        running: Arc<AtomicBool>,
        output_channels: usize,
    ) -> AudioResult<Stream> {
        let callbacks = AtomicUsize::new(0);

        let stream = device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    if !running.load(Ordering::Relaxed) {
                        for sample in data.iter_mut() {
                            *sample = T::EQUILIBRIUM;
                        }
                        return;
                    }

                    let samples_needed = data.len() / output_channels.max(1);

                    // Never block the audio thread on the mixer
                    let mixed = match mixer.try_lock() {
                        Ok(mut m) => m.get_mixed_output(samples_needed),
                        Err(_) => vec![0i16; samples_needed],
                    };

                    let count = callbacks.fetch_add(1, Ordering::Relaxed);
                    if count % 500 == 0 {
                        let has_audio = mixed.iter().any(|&s| s != 0);
                        debug!("Playback callback #{count}: {samples_needed} samples, audio={has_audio}");
                    }

                    // Mono -> every output channel
                    for (chunk, &sample) in data.chunks_mut(output_channels.max(1)).zip(
                        mixed.iter().chain(std::iter::repeat(&0)),
                    ) {
                        let value = sample as f32 / 32768.0;
                        for output in chunk.iter_mut() {
                            *output = T::from_sample(value);
                        }
                    }
                },
                move |err| {
                    error!("Audio playback error: {err}");
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuild(format!("Failed to build stream: {e}")))?;

        Ok(stream)
    }

    /// List available output devices
    pub fn list_devices() -> AudioResult<Vec<AudioDevice>> {
        let host = cpal::default_host();
        let default_device_name = host.default_output_device().and_then(|d| d.name().ok());

        let devices = host
            .output_devices()
            .map_err(|e| AudioError::Init(format!("Failed to enumerate devices: {e}")))?;

        let mut result = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                let is_default = default_device_name.as_ref() == Some(&name);
                result.push(AudioDevice {
                    id: name.clone(),
                    name,
                    is_default,
                });
            }
        }

        Ok(result)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Playback-queue sink that feeds the speaker mixer.
///
/// `play` returns once the fragment has had time to drain, so the queue
/// advances at the speaker's pace and fragments never overlap.
pub struct MixerOutput {
    mixer: Arc<Mutex<AudioMixer>>,
    running: Arc<AtomicBool>,
}

impl MixerOutput {
    pub fn new(mixer: Arc<Mutex<AudioMixer>>, playback: &AudioPlayback) -> Self {
        Self {
            mixer,
            running: playback.running.clone(),
        }
    }
}

#[async_trait]
impl AudioOutput for MixerOutput {
    async fn play(&self, from: &UserId, frame: PcmFrame) -> Result<(), PlaybackError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(PlaybackError::Closed);
        }
        {
            let mut mixer = self
                .mixer
                .lock()
                .map_err(|_| PlaybackError::Device("mixer poisoned".into()))?;
            mixer.push_frame(from, &frame);
        }
        tokio::time::sleep(Duration::from_millis(frame.duration_ms())).await;
        Ok(())
    }
}
