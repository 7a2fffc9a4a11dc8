//! Chunked fallback transport.
//!
//! Instead of negotiating peer connections, the capture is cut into short
//! fragments that are broadcast on the channel's audio topic. Every receiver
//! decodes and plays them through its playback queue.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use voxlink_protocol::codec::{encode_fragment, from_transport, to_transport};
use voxlink_protocol::{AudioCodec, ChannelId, PcmFrame, SignalMessage, UserId};

use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::events::VoiceEventHandler;
use crate::media::{LocalCaptureStream, LocalTrack};
use crate::notices::NoticeListener;
use crate::playback::{Fragment, PlaybackQueue};
use crate::presence::PresenceTracker;
use crate::session::ConnectionState;
use crate::signaling::{Inbound, SignalingChannel};
use crate::transport::Publisher;

/// Fragments are µ-law: half the size of PCM on a text transport
const FRAGMENT_CODEC: AudioCodec = AudioCodec::MuLaw;

const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackStatus {
    pub state: ConnectionState,
    pub transmitting: bool,
    pub receiving: bool,
    pub participants: BTreeSet<UserId>,
    pub fragments_sent: u64,
    pub fragments_received: u64,
    pub fragments_played: u64,
    pub fragments_dropped: u64,
}

impl FallbackStatus {
    pub fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            transmitting: false,
            receiving: false,
            participants: BTreeSet::new(),
            fragments_sent: 0,
            fragments_received: 0,
            fragments_played: 0,
            fragments_dropped: 0,
        }
    }
}

pub(crate) enum FallbackCommand {
    StartTransmission(oneshot::Sender<()>),
    StopTransmission(oneshot::Sender<()>),
    Disconnect(oneshot::Sender<()>),
}

/// Handle to a running fallback session
pub struct FallbackSession {
    local: UserId,
    channel: ChannelId,
    cmd_tx: mpsc::Sender<FallbackCommand>,
    status: watch::Receiver<FallbackStatus>,
}

impl FallbackSession {
    pub fn local_user(&self) -> &UserId {
        &self.local
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    async fn request(&self, cmd: impl FnOnce(oneshot::Sender<()>) -> FallbackCommand) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(cmd(tx))
            .await
            .map_err(|_| VoiceError::SessionClosed)?;
        rx.await.map_err(|_| VoiceError::SessionClosed)
    }

    /// Begin broadcasting fragments of the microphone
    pub async fn start_transmission(&self) -> VoiceResult<()> {
        self.request(FallbackCommand::StartTransmission).await
    }

    /// Stop cutting fragments. A fragment already being sent still goes out.
    pub async fn stop_transmission(&self) -> VoiceResult<()> {
        self.request(FallbackCommand::StopTransmission).await
    }

    /// Leave the audio topic and release the microphone. Idempotent.
    pub async fn disconnect(&self) -> VoiceResult<()> {
        match self.request(FallbackCommand::Disconnect).await {
            Err(VoiceError::SessionClosed) => Ok(()),
            other => other,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    pub fn status(&self) -> FallbackStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<FallbackStatus> {
        self.status.clone()
    }
}

pub(crate) struct FallbackParts {
    pub local: UserId,
    pub channel: ChannelId,
    pub config: VoiceConfig,
    pub handler: Arc<dyn VoiceEventHandler>,
    pub capture: LocalCaptureStream,
    pub audio: SignalingChannel,
    pub notices: NoticeListener,
    pub queue: PlaybackQueue,
}

pub(crate) fn spawn_fallback(parts: FallbackParts) -> FallbackSession {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let mut initial = FallbackStatus::disconnected();
    initial.state = ConnectionState::Connected;
    let (status_tx, status_rx) = watch::channel(initial);

    let session = FallbackSession {
        local: parts.local.clone(),
        channel: parts.channel.clone(),
        cmd_tx,
        status: status_rx,
    };

    let actor = FallbackActor {
        presence: PresenceTracker::new(parts.config.presence_timeout),
        next_heartbeat: Instant::now() + parts.config.heartbeat_interval,
        local: parts.local,
        config: parts.config,
        handler: parts.handler,
        capture: parts.capture,
        audio: parts.audio,
        notices: parts.notices,
        queue: parts.queue,
        fragmenter: None,
        sent: Arc::new(AtomicU64::new(0)),
        received: 0,
        decode_failures: 0,
        last_seq: HashMap::new(),
        last_audio: None,
        status: status_tx,
    };
    tokio::spawn(actor.run(cmd_rx));

    session
}

struct Fragmenter {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct FallbackActor {
    local: UserId,
    config: VoiceConfig,
    handler: Arc<dyn VoiceEventHandler>,
    capture: LocalCaptureStream,
    audio: SignalingChannel,
    notices: NoticeListener,
    queue: PlaybackQueue,
    fragmenter: Option<Fragmenter>,
    sent: Arc<AtomicU64>,
    received: u64,
    decode_failures: u64,
    last_seq: HashMap<UserId, u64>,
    presence: PresenceTracker,
    next_heartbeat: Instant,
    last_audio: Option<Instant>,
    status: watch::Sender<FallbackStatus>,
}

impl FallbackActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<FallbackCommand>) {
        info!("Fallback audio started for {} on {}", self.local, self.audio.topic());
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reply = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(FallbackCommand::StartTransmission(reply)) => {
                        self.start_transmission();
                        let _ = reply.send(());
                    }
                    Some(FallbackCommand::StopTransmission(reply)) => {
                        self.stop_transmission().await;
                        let _ = reply.send(());
                    }
                    Some(FallbackCommand::Disconnect(reply)) => break Some(reply),
                    None => break None,
                },
                inbound = self.audio.next_inbound() => match inbound {
                    Some(inbound) => self.handle_inbound(inbound),
                    None => {
                        error!("Audio subscription for {} ended", self.local);
                        break None;
                    }
                },
                _ = tick.tick() => self.housekeeping().await,
            }
            self.publish_status();
        };

        self.shutdown().await;
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    fn start_transmission(&mut self) {
        if self.fragmenter.is_some() {
            debug!("Already transmitting");
            return;
        }
        self.capture.set_enabled(true);

        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_fragmenter(
            self.capture.track(),
            self.audio.publisher(),
            self.local.clone(),
            self.config.fragment_ms,
            self.sent.clone(),
            stop_rx,
        ));
        self.fragmenter = Some(Fragmenter { stop, task });
        info!("{} started fallback transmission", self.local);
    }

    async fn stop_transmission(&mut self) {
        let Some(fragmenter) = self.fragmenter.take() else {
            return;
        };
        self.capture.set_enabled(false);
        let _ = fragmenter.stop.send(());
        if let Err(e) = fragmenter.task.await {
            warn!("Fragmenter ended abnormally: {e}");
        }
        info!("{} stopped fallback transmission", self.local);
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let now = Instant::now();
        match inbound {
            Inbound::Joined(user) => {
                if self.presence.join(&user, now) {
                    info!("{user} joined the audio channel");
                    self.handler.on_peer_joined(&user);
                }
            }
            Inbound::Left(user) => {
                self.last_seq.remove(&user);
                if self.presence.leave(&user) {
                    info!("{user} left the audio channel");
                    self.handler.on_peer_left(&user);
                }
            }
            Inbound::AudioChunk {
                from,
                audio_data,
                timestamp,
                seq,
            } => {
                if self.presence.join(&from, now) {
                    self.handler.on_peer_joined(&from);
                }
                self.track_sequence(&from, seq);
                self.received += 1;
                self.last_audio = Some(now);

                match from_transport(&audio_data) {
                    Ok(payload) => {
                        trace!("Fragment from {from} captured at {timestamp}");
                        self.queue.enqueue(Fragment { from, payload });
                    }
                    Err(e) => {
                        warn!("Dropping fragment from {from}: {e}");
                        self.decode_failures += 1;
                    }
                }
            }
            Inbound::VoiceMessage(notice) => self.handler.on_voice_message(&notice),
            other => trace!("Ignoring {other:?} on the audio topic"),
        }
    }

    /// Playback stays in arrival order; gaps and reordering are only logged
    fn track_sequence(&mut self, from: &UserId, seq: Option<u64>) {
        let Some(seq) = seq else {
            return;
        };
        if let Some(last) = self.last_seq.insert(from.clone(), seq) {
            if seq <= last {
                debug!("Fragment {seq} from {from} arrived after {last}");
            } else if seq > last + 1 {
                debug!("Lost {} fragments from {from}", seq - last - 1);
            }
        }
    }

    async fn housekeeping(&mut self) {
        let now = Instant::now();
        let heartbeat = self.config.heartbeat_interval;
        if !heartbeat.is_zero() && now >= self.next_heartbeat {
            self.next_heartbeat = now + heartbeat;
            if let Err(e) = self.audio.announce_presence().await {
                warn!("Presence heartbeat failed: {e}");
            }
        }

        for user in self.presence.evict_stale(now) {
            warn!("{user} went silent, evicting");
            self.last_seq.remove(&user);
            self.handler.on_peer_left(&user);
        }
    }

    fn snapshot(&self) -> FallbackStatus {
        let stats = self.queue.stats();
        FallbackStatus {
            state: ConnectionState::Connected,
            transmitting: self.fragmenter.is_some(),
            receiving: self
                .last_audio
                .map(|at| at.elapsed() < self.config.receiving_hold)
                .unwrap_or(false),
            participants: self.presence.users(),
            fragments_sent: self.sent.load(Ordering::Relaxed),
            fragments_received: self.received,
            fragments_played: stats.played,
            fragments_dropped: stats.dropped + self.decode_failures,
        }
    }

    fn publish_status(&self) {
        let next = self.snapshot();
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    async fn shutdown(mut self) {
        info!("Disconnecting {} from {}", self.local, self.audio.topic());
        self.stop_transmission().await;
        if let Err(e) = self.audio.announce_departure().await {
            warn!("Could not announce departure: {e}");
        }
        self.capture.stop();
        self.queue.clear();
        self.presence.clear();

        self.audio.close().await;
        self.notices.close().await;
        self.status.send_replace(FallbackStatus::disconnected());
        info!("Fallback audio for {} closed", self.local);
    }
}

/// Cut the local track into fixed-length fragments and publish each one
async fn run_fragmenter(
    mut track: LocalTrack,
    publisher: Publisher,
    user: UserId,
    fragment_ms: u32,
    sent: Arc<AtomicU64>,
    mut stop: oneshot::Receiver<()>,
) {
    let constraints = track.constraints();
    let channels = constraints.channels.max(1);
    let per_fragment = (constraints.sample_rate as usize * fragment_ms as usize / 1000).max(1)
        * channels as usize;

    let mut pending: Vec<i16> = Vec::with_capacity(per_fragment * 2);
    let mut seq: u64 = 0;

    loop {
        let frame = tokio::select! {
            _ = &mut stop => break,
            frame = track.next_frame() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        pending.extend_from_slice(&frame.samples);

        while pending.len() >= per_fragment {
            let samples: Vec<i16> = pending.drain(..per_fragment).collect();
            let fragment = PcmFrame::new(constraints.sample_rate, channels, samples);
            let message = SignalMessage::AudioChunk {
                audio_data: to_transport(&encode_fragment(&fragment, FRAGMENT_CODEC)),
                user_id: user.clone(),
                timestamp: chrono::Utc::now().timestamp_millis(),
                seq: Some(seq),
            };
            seq += 1;

            match publisher.send_message(&message).await {
                Ok(()) => {
                    sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!("Fragment {} from {user} not delivered: {e}", seq - 1),
            }
        }
    }

    if !pending.is_empty() {
        trace!("Discarding {} samples of partial fragment", pending.len());
    }
    debug!("Fragmenter for {user} stopped after {seq} fragments");
}
