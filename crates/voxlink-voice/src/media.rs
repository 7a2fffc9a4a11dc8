//! Microphone seam and the owned local capture stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use voxlink_protocol::PcmFrame;

use crate::error::{MediaAccessError, VoiceResult};
use crate::guard::{Claim, ResourceGuard};

/// Frames buffered per track before a slow consumer starts losing audio
const TRACK_BUFFER_FRAMES: usize = 64;

/// What the caller asks of the microphone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u8,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl CaptureConstraints {
    pub fn voice(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Platform microphone access (cpal, a browser bridge, a test script, ...)
#[async_trait]
pub trait MediaDevices: Send + Sync + 'static {
    /// Open the microphone. Fails with `PermissionDenied` or `NoDevice`.
    async fn open_microphone(
        &self,
        constraints: CaptureConstraints,
    ) -> Result<Box<dyn CaptureSource>, MediaAccessError>;
}

/// A running microphone capture
pub trait CaptureSource: Send + 'static {
    /// Take the frame stream. Returns `None` after the first call.
    fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<PcmFrame>>;

    /// Stop the underlying device stream
    fn stop(&mut self);

    /// Human-readable device name
    fn label(&self) -> String;
}

/// The single live microphone stream of a client.
///
/// Holds the capture claim for its whole lifetime; stopping or dropping it
/// releases the device and the claim.
pub struct LocalCaptureStream {
    source: Box<dyn CaptureSource>,
    constraints: CaptureConstraints,
    enabled: Arc<AtomicBool>,
    frames: broadcast::Sender<PcmFrame>,
    pump: Option<JoinHandle<()>>,
    claim: Option<Claim>,
}

impl LocalCaptureStream {
    /// Claim the microphone and open it. Tracks start disabled (muted).
    pub async fn acquire(
        devices: &dyn MediaDevices,
        guard: &ResourceGuard,
        constraints: CaptureConstraints,
    ) -> VoiceResult<Self> {
        let claim = guard.claim_capture()?;
        let mut source = devices.open_microphone(constraints).await?;
        let Some(mut raw) = source.take_frames() else {
            source.stop();
            return Err(MediaAccessError::Device("capture source has no frame stream".into()).into());
        };

        let label = source.label();
        let enabled = Arc::new(AtomicBool::new(false));
        let (frames, _) = broadcast::channel(TRACK_BUFFER_FRAMES);

        let pump_enabled = enabled.clone();
        let pump_frames = frames.clone();
        let pump = tokio::spawn(async move {
            while let Some(frame) = raw.recv().await {
                if pump_enabled.load(Ordering::Relaxed) {
                    // No receivers is fine: nobody is consuming yet
                    let _ = pump_frames.send(frame);
                }
            }
            debug!("Capture frame stream ended");
        });

        info!(
            "Capture stream opened on {label} ({} Hz, {} ch)",
            constraints.sample_rate, constraints.channels
        );

        Ok(Self {
            source,
            constraints,
            enabled,
            frames,
            pump: Some(pump),
            claim: Some(claim),
        })
    }

    pub fn constraints(&self) -> CaptureConstraints {
        self.constraints
    }

    /// A new consumer of the outbound audio
    pub fn track(&self) -> LocalTrack {
        LocalTrack {
            enabled: self.enabled.clone(),
            frames: self.frames.subscribe(),
            constraints: self.constraints,
        }
    }

    /// Mute semantics: frames are only forwarded while enabled
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        debug!("Local audio track enabled: {enabled}");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn is_live(&self) -> bool {
        self.claim.is_some()
    }

    /// Stop every track and release the device. Safe to call twice.
    pub fn stop(&mut self) {
        if self.claim.is_none() {
            return;
        }
        self.enabled.store(false, Ordering::Relaxed);
        self.source.stop();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.claim = None;
        info!("Capture stream stopped");
    }
}

impl Drop for LocalCaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One consumer's view of the local capture
pub struct LocalTrack {
    enabled: Arc<AtomicBool>,
    frames: broadcast::Receiver<PcmFrame>,
    constraints: CaptureConstraints,
}

impl LocalTrack {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn constraints(&self) -> CaptureConstraints {
        self.constraints
    }

    /// Next captured frame, `None` once the capture stream is gone.
    pub async fn next_frame(&mut self) -> Option<PcmFrame> {
        loop {
            match self.frames.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Local track lagged, skipped {skipped} frames");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeSource {
        frames: Option<mpsc::UnboundedReceiver<PcmFrame>>,
        stopped: Arc<AtomicBool>,
    }

    impl CaptureSource for FakeSource {
        fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<PcmFrame>> {
            self.frames.take()
        }

        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn label(&self) -> String {
            "fake".into()
        }
    }

    struct FakeDevices {
        feed: std::sync::Mutex<Option<mpsc::UnboundedReceiver<PcmFrame>>>,
        stopped: Arc<AtomicBool>,
        opened: AtomicUsize,
        deny: bool,
    }

    #[async_trait]
    impl MediaDevices for FakeDevices {
        async fn open_microphone(
            &self,
            _constraints: CaptureConstraints,
        ) -> Result<Box<dyn CaptureSource>, MediaAccessError> {
            if self.deny {
                return Err(MediaAccessError::PermissionDenied);
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSource {
                frames: self.feed.lock().unwrap().take(),
                stopped: self.stopped.clone(),
            }))
        }
    }

    fn devices(deny: bool) -> (FakeDevices, mpsc::UnboundedSender<PcmFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let devices = FakeDevices {
            feed: std::sync::Mutex::new(Some(rx)),
            stopped: Arc::new(AtomicBool::new(false)),
            opened: AtomicUsize::new(0),
            deny,
        };
        (devices, tx)
    }

    fn frame(value: i16) -> PcmFrame {
        PcmFrame::new(48000, 1, vec![value; 960])
    }

    #[tokio::test(start_paused = true)]
    async fn test_muted_frames_are_not_forwarded() {
        let (devices, feed) = devices(false);
        let guard = ResourceGuard::new();
        let stream = LocalCaptureStream::acquire(&devices, &guard, CaptureConstraints::voice(48000))
            .await
            .unwrap();
        let mut track = stream.track();

        feed.send(frame(1)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(track.frames.try_recv().is_err());

        stream.set_enabled(true);
        feed.send(frame(2)).unwrap();
        let received = track.next_frame().await.unwrap();
        assert_eq!(received.samples[0], 2);
    }

    #[tokio::test]
    async fn test_stop_releases_claim() {
        let (devices, _feed) = devices(false);
        let guard = ResourceGuard::new();
        let mut stream =
            LocalCaptureStream::acquire(&devices, &guard, CaptureConstraints::voice(48000))
                .await
                .unwrap();
        assert!(guard.capture_held());

        stream.stop();
        stream.stop();
        assert!(!guard.capture_held());
        assert!(devices.stopped.load(Ordering::SeqCst));
        assert!(!stream.is_live());
    }

    #[tokio::test]
    async fn test_denied_permission_leaves_nothing_held() {
        let (devices, _feed) = devices(true);
        let guard = ResourceGuard::new();
        let result =
            LocalCaptureStream::acquire(&devices, &guard, CaptureConstraints::voice(48000)).await;
        assert!(matches!(
            result,
            Err(crate::error::VoiceError::MediaAccess(MediaAccessError::PermissionDenied))
        ));
        assert!(!guard.capture_held());
        assert_eq!(devices.opened.load(Ordering::SeqCst), 0);
    }
}
