//! Audio capture from microphone using cpal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleFormat, Stream, StreamConfig};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use voxlink_protocol::PcmFrame;
use voxlink_voice::{CaptureConstraints, CaptureSource, MediaAccessError, MediaDevices};

use super::{
    downmix, to_i16, AudioDevice, AudioError, AudioResult, RateConverter, CAPTURE_CHUNK_MS,
};

/// Microphones of the default cpal host.
///
/// cpal streams are not `Send`, so every capture owns a thread that builds
/// the stream and keeps it alive until stopped.
pub struct CpalDevices {
    device_id: Option<String>,
}

impl CpalDevices {
    /// Capture from the default input device, or the named one
    pub fn new(device_id: Option<String>) -> Self {
        Self { device_id }
    }

    /// List available input devices
    pub fn list_devices() -> AudioResult<Vec<AudioDevice>> {
        let host = cpal::default_host();
        let default_device_name = host.default_input_device().and_then(|d| d.name().ok());

        let devices = host
            .input_devices()
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
}

impl From<AudioError> for MediaAccessError {
    fn from(e: AudioError) -> Self {
        match e {
            AudioError::DeviceNotFound(name) => MediaAccessError::NoDevice(name),
            other => MediaAccessError::Device(other.to_string()),
        }
    }
}

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn open_microphone(
        &self,
        constraints: CaptureConstraints,
    ) -> Result<Box<dyn CaptureSource>, MediaAccessError> {
        if constraints.echo_cancellation || constraints.noise_suppression {
            debug!("Capture processing is not available through cpal, capturing raw audio");
        }

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let running = Arc::new(AtomicBool::new(true));

        let device_id = self.device_id.clone();
        let thread_running = running.clone();
        thread::Builder::new()
            .name("voxlink-capture".into())
            .spawn(move || {
                let stream =
                    match AudioCapture::start(device_id.as_deref(), constraints, frame_tx, thread_running)
                    {
                        Ok((stream, label)) => {
                            let _ = ready_tx.send(Ok(label));
                            stream
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                // Blocks until stop() or the source is dropped
                let _ = stop_rx.recv();
                drop(stream);
                info!("Audio capture stopped");
            })
            .map_err(|e| MediaAccessError::Device(format!("Failed to spawn capture thread: {e}")))?;

        let label = ready_rx
            .await
            .map_err(|_| MediaAccessError::Device("Capture thread exited".into()))??;

        Ok(Box::new(CpalSource {
            label,
            frames: Some(frame_rx),
            running,
            stop: Some(stop_tx),
        }))
    }
}

struct CpalSource {
    label: String,
    frames: Option<mpsc::UnboundedReceiver<PcmFrame>>,
    running: Arc<AtomicBool>,
    stop: Option<std_mpsc::Sender<()>>,
}

impl CaptureSource for CpalSource {
    fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<PcmFrame>> {
        self.frames.take()
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Stream construction, run on the capture thread
struct AudioCapture;

impl AudioCapture {
    fn start(
        device_id: Option<&str>,
        constraints: CaptureConstraints,
        frame_tx: mpsc::UnboundedSender<PcmFrame>,
        running: Arc<AtomicBool>,
    ) -> Result<(Stream, String), MediaAccessError> {
        let host = cpal::default_host();

        let device = match device_id {
            Some(id) => Self::find_device(&host, id)?,
            None => host
                .default_input_device()
                .ok_or_else(|| AudioError::DeviceNotFound("No default input device".into()))?,
        };

        let device_name = device.name().unwrap_or_else(|_| "Unknown".into());
        info!("Starting audio capture on: {}", device_name);

        let supported_config = device
            .default_input_config()
            .map_err(|e| AudioError::Init(format!("Failed to get input config: {e}")))?;

        let sample_format = supported_config.sample_format();
        let config: StreamConfig = supported_config.into();
        let input_sample_rate = config.sample_rate.0;
        let input_channels = config.channels as usize;

        debug!(
            "Input config: {} Hz, {} channels, {:?} -> {} Hz",
            input_sample_rate, input_channels, sample_format, constraints.sample_rate
        );

        let resampler = if input_sample_rate != constraints.sample_rate {
            Some(RateConverter::new(input_sample_rate, constraints.sample_rate)?)
        } else {
            None
        };
        let pipeline = CapturePipeline {
            frame_tx,
            running,
            input_channels,
            resampler,
            buffer: Vec::new(),
            chunk: (input_sample_rate / 1000 * CAPTURE_CHUNK_MS) as usize * input_channels,
            output_rate: constraints.sample_rate,
        };

        let stream = match sample_format {
            SampleFormat::F32 => Self::build_stream::<f32>(&device, &config, pipeline)?,
            SampleFormat::I16 => Self::build_stream::<i16>(&device, &config, pipeline)?,
            SampleFormat::U16 => Self::build_stream::<u16>(&device, &config, pipeline)?,
            _ => {
                return Err(AudioError::Init(format!(
                    "Unsupported sample format: {:?}",
                    sample_format
                ))
                .into());
            }
        };

        stream
            .play()
            .map_err(|e| AudioError::Stream(format!("Failed to start stream: {e}")))?;

        info!("Audio capture started");
        Ok((stream, device_name))
    }

    fn find_device(host: &Host, device_id: &str) -> AudioResult<Device> {
        let devices = host
            .input_devices()
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

    fn build_stream<T: cpal::Sample + cpal::SizedSample + Send + 'static>(
        device: &Device,
        config: &StreamConfig,
        mut pipeline: CapturePipeline,
    ) -> AudioResult<Stream>
    where
        f32: cpal::FromSample<T>,
    {
        let stream = device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    if !pipeline.running.load(Ordering::Relaxed) {
                        return;
                    }
                    pipeline
                        .buffer
                        .extend(data.iter().map(|s| -> f32 { cpal::Sample::from_sample(*s) }));
                    pipeline.drain();
                },
                move |err| {
                    error!("Audio capture error: {err}");
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuild(format!("Failed to build stream: {e}")))?;

        Ok(stream)
    }
}

/// Per-stream state moved into the cpal callback
struct CapturePipeline {
    frame_tx: mpsc::UnboundedSender<PcmFrame>,
    running: Arc<AtomicBool>,
    input_channels: usize,
    resampler: Option<RateConverter>,
    buffer: Vec<f32>,
    chunk: usize,
    output_rate: u32,
}

impl CapturePipeline {
    /// Turn buffered device samples into mono frames at the session rate
    fn drain(&mut self) {
        while self.buffer.len() >= self.chunk {
            let raw: Vec<f32> = self.buffer.drain(..self.chunk).collect();
            let mono = downmix(&raw, self.input_channels);

            let samples = match self.resampler.as_mut() {
                Some(r) => match r.process(&mono) {
                    Ok(out) => out,
                    Err(e) => {
                        warn!("Resample error: {e}");
                        continue;
                    }
                },
                None => mono,
            };
            if samples.is_empty() {
                continue;
            }

            let pcm: Vec<i16> = samples.iter().map(|&s| to_i16(s)).collect();
            if self
                .frame_tx
                .send(PcmFrame::new(self.output_rate, 1, pcm))
                .is_err()
            {
                // Receiver dropped, stop capturing
                self.running.store(false, Ordering::Relaxed);
                return;
            }
        }
    }
}
