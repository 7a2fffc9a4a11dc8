//! Scripted platform seams shared by the scenario tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use voxlink_protocol::{Envelope, IceCandidate, PcmFrame, SessionDescription, SignalMessage, UserId};
use voxlink_voice::playback::{AudioOutput, PlaybackError};
use voxlink_voice::{
    BroadcastTransport, CaptureConstraints, CaptureSource, ConnectionEvent, ConnectionEvents,
    ConnectionId, LocalBroadcastHub, LocalTrack, MediaAccessError, MediaDevices, MediaState,
    NegotiationError, PeerConnection, PeerConnector, StaticDirectory, Subscription, VoiceClient,
    VoiceConfig, VoiceEvent,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Microphone whose frames are pushed by the test
pub struct ScriptedDevices {
    deny: bool,
    pub opened: AtomicUsize,
    pub stopped: Arc<AtomicBool>,
    feed: Mutex<Option<mpsc::UnboundedSender<PcmFrame>>>,
}

impl ScriptedDevices {
    pub fn granted() -> Arc<Self> {
        Arc::new(Self {
            deny: false,
            opened: AtomicUsize::new(0),
            stopped: Arc::new(AtomicBool::new(false)),
            feed: Mutex::new(None),
        })
    }

    pub fn denied() -> Arc<Self> {
        Arc::new(Self {
            deny: true,
            opened: AtomicUsize::new(0),
            stopped: Arc::new(AtomicBool::new(false)),
            feed: Mutex::new(None),
        })
    }

    /// Push a captured frame into the most recently opened microphone
    pub fn capture(&self, frame: PcmFrame) {
        if let Some(feed) = self.feed.lock().unwrap().as_ref() {
            let _ = feed.send(frame);
        }
    }
}

struct ScriptedSource {
    frames: Option<mpsc::UnboundedReceiver<PcmFrame>>,
    stopped: Arc<AtomicBool>,
}

impl CaptureSource for ScriptedSource {
    fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<PcmFrame>> {
        self.frames.take()
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn label(&self) -> String {
        "scripted microphone".into()
    }
}

#[async_trait]
impl MediaDevices for ScriptedDevices {
    async fn open_microphone(
        &self,
        _constraints: CaptureConstraints,
    ) -> Result<Box<dyn CaptureSource>, MediaAccessError> {
        if self.deny {
            return Err(MediaAccessError::PermissionDenied);
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.feed.lock().unwrap() = Some(tx);
        Ok(Box::new(ScriptedSource {
            frames: Some(rx),
            stopped: self.stopped.clone(),
        }))
    }
}

/// Media engine double: descriptions are plain strings, an answer whose sdp
/// is `"bad"` is rejected, and media "connects" as soon as a remote
/// description is installed.
#[derive(Default)]
pub struct ScriptedConnector {
    pub created: Mutex<Vec<UserId>>,
    pub applied_candidates: Arc<Mutex<Vec<(UserId, String)>>>,
    pub closed: Arc<Mutex<Vec<UserId>>>,
    pub fail_create: Mutex<HashSet<UserId>>,
    /// Stay in the negotiating states instead of reporting connected media
    pub hold_media: AtomicBool,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn holding_media() -> Arc<Self> {
        let connector = Self::default();
        connector.hold_media.store(true, Ordering::SeqCst);
        Arc::new(connector)
    }
}

#[async_trait]
impl PeerConnector for ScriptedConnector {
    async fn create(
        &self,
        peer: &UserId,
        connection: ConnectionId,
        _local: LocalTrack,
        events: ConnectionEvents,
    ) -> Result<Box<dyn PeerConnection>, NegotiationError> {
        if self.fail_create.lock().unwrap().contains(peer) {
            return Err(NegotiationError::Engine("scripted failure".into()));
        }
        self.created.lock().unwrap().push(peer.clone());
        Ok(Box::new(ScriptedConnection {
            peer: peer.clone(),
            connection,
            events,
            connect_media: !self.hold_media.load(Ordering::SeqCst),
            applied_candidates: self.applied_candidates.clone(),
            closed: self.closed.clone(),
        }))
    }
}

struct ScriptedConnection {
    peer: UserId,
    connection: ConnectionId,
    events: ConnectionEvents,
    connect_media: bool,
    applied_candidates: Arc<Mutex<Vec<(UserId, String)>>>,
    closed: Arc<Mutex<Vec<UserId>>>,
}

impl ScriptedConnection {
    fn media_up(&self) {
        if !self.connect_media {
            return;
        }
        let _ = self.events.send(ConnectionEvent::StateChanged {
            peer: self.peer.clone(),
            connection: self.connection,
            state: MediaState::Connected,
        });
        let _ = self.events.send(ConnectionEvent::RemoteTrack {
            peer: self.peer.clone(),
            connection: self.connection,
        });
    }

    fn gather(&self) {
        let _ = self.events.send(ConnectionEvent::LocalCandidate {
            peer: self.peer.clone(),
            connection: self.connection,
            candidate: IceCandidate {
                candidate: format!("candidate:local-for-{}", self.peer),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        });
    }
}

#[async_trait]
impl PeerConnection for ScriptedConnection {
    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.gather();
        Ok(SessionDescription::offer(format!("v=0 offer to {}", self.peer)))
    }

    async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        if offer.sdp == "bad" {
            return Err(NegotiationError::InvalidDescription("scripted".into()));
        }
        self.gather();
        self.media_up();
        Ok(SessionDescription::answer(format!("v=0 answer to {}", self.peer)))
    }

    async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if answer.sdp == "bad" {
            return Err(NegotiationError::InvalidDescription("scripted".into()));
        }
        self.media_up();
        Ok(())
    }

    async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        self.applied_candidates
            .lock()
            .unwrap()
            .push((self.peer.clone(), candidate.candidate));
        Ok(())
    }

    /// Reports `Closed` afterwards, as real engines do
    async fn close(&mut self) {
        self.closed.lock().unwrap().push(self.peer.clone());
        let _ = self.events.send(ConnectionEvent::StateChanged {
            peer: self.peer.clone(),
            connection: self.connection,
            state: MediaState::Closed,
        });
    }
}

/// Speaker double recording what was played
#[derive(Default)]
pub struct MemoryOutput {
    pub played: Mutex<Vec<(UserId, PcmFrame)>>,
}

#[async_trait]
impl AudioOutput for MemoryOutput {
    async fn play(&self, from: &UserId, frame: PcmFrame) -> Result<(), PlaybackError> {
        self.played.lock().unwrap().push((from.clone(), frame));
        Ok(())
    }
}

pub fn test_config() -> VoiceConfig {
    VoiceConfig {
        send_retry_backoff: Duration::from_millis(10),
        ..VoiceConfig::default()
    }
}

pub fn client(
    hub: &Arc<LocalBroadcastHub>,
    devices: &Arc<ScriptedDevices>,
    connector: &Arc<ScriptedConnector>,
    user: &str,
) -> VoiceClient {
    VoiceClient::new(
        devices.clone(),
        hub.clone(),
        Arc::new(StaticDirectory::new(user, "room")),
    )
    .with_config(test_config())
    .with_connector(connector.clone())
}

/// Another participant on a topic, driven by hand
pub struct Observer {
    pub subscription: Subscription,
}

impl Observer {
    pub async fn join(hub: &Arc<LocalBroadcastHub>, topic: &str) -> Self {
        let transport: Arc<dyn BroadcastTransport> = hub.clone();
        let subscription = Subscription::open(transport, topic, Duration::ZERO)
            .await
            .unwrap();
        Self { subscription }
    }

    pub async fn send(&self, message: SignalMessage) {
        self.subscription.send_message(&message).await.unwrap();
    }

    /// Next message satisfying `pred`, skipping others
    pub async fn expect(&mut self, pred: impl Fn(&SignalMessage) -> bool) -> SignalMessage {
        let wait = async {
            loop {
                let envelope: Envelope = self.subscription.recv().await.expect("topic closed");
                let message = SignalMessage::from_envelope(&envelope).unwrap();
                if pred(&message) {
                    return message;
                }
            }
        };
        tokio::time::timeout(WAIT, wait).await.expect("no matching message")
    }

    /// Collect whatever arrives within `window`
    pub async fn drain(&mut self, window: Duration) -> Vec<SignalMessage> {
        let mut messages = Vec::new();
        let _ = tokio::time::timeout(window, async {
            while let Some(envelope) = self.subscription.recv().await {
                if let Ok(message) = SignalMessage::from_envelope(&envelope) {
                    messages.push(message);
                }
            }
        })
        .await;
        messages
    }
}

/// Next event satisfying `pred`, skipping others
pub async fn expect_event(
    events: &mut mpsc::UnboundedReceiver<VoiceEvent>,
    pred: impl Fn(&VoiceEvent) -> bool,
) -> VoiceEvent {
    let wait = async {
        loop {
            let event = events.recv().await.expect("handler dropped");
            if pred(&event) {
                return event;
            }
        }
    };
    tokio::time::timeout(WAIT, wait).await.expect("no matching event")
}

/// Wait until the watched value satisfies `pred`
pub async fn wait_until<T>(rx: &mut watch::Receiver<T>, pred: impl FnMut(&T) -> bool) {
    tokio::time::timeout(WAIT, rx.wait_for(pred))
        .await
        .expect("condition not reached")
        .expect("status channel closed");
}
