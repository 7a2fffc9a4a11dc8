//! Serialized decode + playback of inbound fragments.
//!
//! At most one fragment is decoded and played at a time, in arrival order.
//! A fragment that fails to decode or play is logged and dropped; the next
//! one proceeds.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use voxlink_protocol::codec::decode_fragment;
use voxlink_protocol::{PcmFrame, UserId};

use crate::events::VoiceEventHandler;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("Output device error: {0}")]
    Device(String),

    #[error("Output closed")]
    Closed,
}

/// Speaker seam. `play` resolves once the frame has been rendered.
#[async_trait]
pub trait AudioOutput: Send + Sync + 'static {
    async fn play(&self, from: &UserId, frame: PcmFrame) -> Result<(), PlaybackError>;
}

/// An encoded fragment waiting for playback
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub from: UserId,
    /// Fragment container bytes
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Idle,
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackStats {
    pub played: u64,
    pub dropped: u64,
    pub pending: usize,
}

struct Shared {
    pending: Mutex<VecDeque<Fragment>>,
    wake: Notify,
    interrupt: Notify,
    generation: AtomicU64,
    phase: watch::Sender<PlaybackPhase>,
    played: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        let (phase, _) = watch::channel(PlaybackPhase::Idle);
        Self {
            pending: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            interrupt: Notify::new(),
            generation: AtomicU64::new(0),
            phase,
            played: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<Fragment>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Pop the next fragment together with the generation it belongs to
    fn next_fragment(&self) -> Option<(Fragment, u64)> {
        let mut pending = self.pending();
        let fragment = pending.pop_front()?;
        let generation = self.generation.load(Ordering::SeqCst);
        self.set_phase(PlaybackPhase::Playing);
        Some((fragment, generation))
    }

    /// Whether a clear happened since `generation` was read
    fn is_stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    fn clear(&self) -> usize {
        let cleared = {
            let mut pending = self.pending();
            let n = pending.len();
            pending.clear();
            self.generation.fetch_add(1, Ordering::SeqCst);
            n
        };
        self.interrupt.notify_waiters();
        // Wake idle waiters so they re-check the now empty queue
        self.phase.send_modify(|_| {});
        cleared
    }

    fn set_phase(&self, phase: PlaybackPhase) {
        self.phase.send_if_modified(|current| {
            let changed = *current != phase;
            *current = phase;
            changed
        });
    }
}

/// FIFO playback with a single worker
pub struct PlaybackQueue {
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl PlaybackQueue {
    /// `handler` sees every successfully decoded frame before it is played.
    pub fn new(output: Arc<dyn AudioOutput>, handler: Arc<dyn VoiceEventHandler>) -> Self {
        let shared = Arc::new(Shared::new());
        let worker = tokio::spawn(run_worker(shared.clone(), output, handler));
        Self { shared, worker }
    }

    /// Append a fragment. Never waits.
    pub fn enqueue(&self, fragment: Fragment) {
        self.shared.pending().push_back(fragment);
        self.shared.wake.notify_one();
    }

    /// Drop every pending fragment and cut the current one short
    pub fn clear(&self) {
        let cleared = self.shared.clear();
        if cleared > 0 {
            debug!("Playback queue cleared ({cleared} pending dropped)");
        }
    }

    pub fn phase(&self) -> PlaybackPhase {
        *self.shared.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<PlaybackPhase> {
        self.shared.phase.subscribe()
    }

    pub fn stats(&self) -> PlaybackStats {
        PlaybackStats {
            played: self.shared.played.load(Ordering::SeqCst),
            dropped: self.shared.dropped.load(Ordering::SeqCst),
            pending: self.shared.pending().len(),
        }
    }

    /// Resolves once nothing is playing and nothing is pending
    pub async fn wait_idle(&self) {
        let mut phase = self.shared.phase.subscribe();
        loop {
            let idle = *phase.borrow_and_update() == PlaybackPhase::Idle;
            if idle && self.shared.pending().is_empty() {
                return;
            }
            if phase.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    output: Arc<dyn AudioOutput>,
    handler: Arc<dyn VoiceEventHandler>,
) {
    loop {
        let Some((fragment, generation)) = shared.next_fragment() else {
            shared.set_phase(PlaybackPhase::Idle);
            shared.wake.notified().await;
            continue;
        };

        let frame = match decode_fragment(&fragment.payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping fragment from {}: {e}", fragment.from);
                shared.dropped.fetch_add(1, Ordering::SeqCst);
                continue;
            }
        };

        let interrupted = shared.interrupt.notified();
        tokio::pin!(interrupted);
        interrupted.as_mut().enable();
        if shared.is_stale(generation) {
            continue;
        }

        handler.on_audio_received(&fragment.from, &frame);
        tokio::select! {
            result = output.play(&fragment.from, frame) => match result {
                Ok(()) => {
                    shared.played.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    error!("Playback of fragment from {} failed: {e}", fragment.from);
                    shared.dropped.fetch_add(1, Ordering::SeqCst);
                }
            },
            _ = &mut interrupted => {
                debug!("Playback of fragment from {} interrupted", fragment.from);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use voxlink_protocol::codec::encode_fragment;
    use voxlink_protocol::AudioCodec;

    use crate::events::{ChannelEventHandler, VoiceEvent};

    /// Records play order and the peak number of overlapping plays
    #[derive(Default)]
    struct SlowOutput {
        active: AtomicUsize,
        peak: AtomicUsize,
        order: Mutex<Vec<i16>>,
        fail_on: Option<i16>,
    }

    #[async_trait]
    impl AudioOutput for SlowOutput {
        async fn play(&self, _from: &UserId, frame: PcmFrame) -> Result<(), PlaybackError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(frame.samples[0]);
            if Some(frame.samples[0]) == self.fail_on {
                return Err(PlaybackError::Device("glitch".into()));
            }
            Ok(())
        }
    }

    fn fragment(marker: i16) -> Fragment {
        let frame = PcmFrame::new(8000, 1, vec![marker; 160]);
        Fragment {
            from: "userY".into(),
            payload: encode_fragment(&frame, AudioCodec::Pcm16),
        }
    }

    fn queue(output: Arc<SlowOutput>) -> (PlaybackQueue, tokio::sync::mpsc::UnboundedReceiver<VoiceEvent>) {
        let (handler, events) = ChannelEventHandler::new();
        (PlaybackQueue::new(output, Arc::new(handler)), events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_fragment_plays_at_a_time_in_order() {
        let output = Arc::new(SlowOutput::default());
        let (queue, _events) = queue(output.clone());

        for marker in 1..=5 {
            queue.enqueue(fragment(marker));
        }
        queue.wait_idle().await;

        assert_eq!(*output.order.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(output.peak.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().played, 5);
        assert_eq!(queue.phase(), PlaybackPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_queue() {
        let output = Arc::new(SlowOutput {
            fail_on: Some(3),
            ..Default::default()
        });
        let (queue, mut events) = queue(output.clone());

        queue.enqueue(fragment(1));
        queue.enqueue(Fragment {
            from: "userY".into(),
            payload: b"VX\x01\x07garbage".to_vec(),
        });
        queue.enqueue(fragment(3));
        queue.enqueue(fragment(4));
        queue.wait_idle().await;

        assert_eq!(*output.order.lock().unwrap(), vec![1, 3, 4]);
        let stats = queue.stats();
        assert_eq!(stats.played, 2);
        assert_eq!(stats.dropped, 2);

        let mut received = 0;
        while let Ok(event) = events.try_recv() {
            assert!(matches!(event, VoiceEvent::AudioReceived { .. }));
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_pending() {
        let output = Arc::new(SlowOutput::default());
        let (queue, _events) = queue(output.clone());

        for marker in 1..=4 {
            queue.enqueue(fragment(marker));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.phase(), PlaybackPhase::Playing);

        queue.clear();
        queue.wait_idle().await;
        assert_eq!(queue.stats().pending, 0);
        assert!(output.order.lock().unwrap().is_empty());

        queue.enqueue(fragment(9));
        queue.wait_idle().await;
        assert_eq!(*output.order.lock().unwrap(), vec![9]);
    }

    #[test]
    fn test_fragment_taken_before_clear_is_stale() {
        let shared = Shared::new();
        shared.pending().push_back(fragment(1));
        shared.pending().push_back(fragment(2));

        let (taken, generation) = shared.next_fragment().unwrap();
        assert_eq!(taken, fragment(1));
        assert!(!shared.is_stale(generation));

        assert_eq!(shared.clear(), 1);
        assert!(shared.is_stale(generation));
        assert!(shared.next_fragment().is_none());

        shared.pending().push_back(fragment(3));
        let (_, generation) = shared.next_fragment().unwrap();
        assert!(!shared.is_stale(generation));
    }
}
