//! Peer audio session manager.
//!
//! A single actor task owns the capture stream, the signaling subscription
//! and every per-peer state machine. The `VoiceSession` handle talks to it
//! over a command channel, so no state is shared between tasks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use voxlink_protocol::{ChannelId, IceCandidate, SessionDescription, UserId};

use crate::config::VoiceConfig;
use crate::connector::{ConnectionEvent, ConnectionId, MediaState, PeerConnector};
use crate::error::{NegotiationError, VoiceError, VoiceResult};
use crate::events::VoiceEventHandler;
use crate::media::LocalCaptureStream;
use crate::notices::NoticeListener;
use crate::peer::{Peer, PeerState, PeerTransition};
use crate::presence::PresenceTracker;
use crate::signaling::{Inbound, SignalingChannel};

/// Housekeeping period for timeouts, heartbeats and eviction
const TICK: Duration = Duration::from_millis(100);

/// Overall session state shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    /// Live, with negotiations in flight and no peer connected yet
    Connecting,
    Connected,
}

/// Snapshot of a session, published on every change
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub transmitting: bool,
    pub receiving: bool,
    /// Peers with media flowing
    pub connected_users: BTreeSet<UserId>,
    /// Everyone seen on the channel
    pub participants: BTreeSet<UserId>,
    pub peers: BTreeMap<UserId, PeerState>,
    pub connected_peer_count: usize,
}

impl SessionStatus {
    pub fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            transmitting: false,
            receiving: false,
            connected_users: BTreeSet::new(),
            participants: BTreeSet::new(),
            peers: BTreeMap::new(),
            connected_peer_count: 0,
        }
    }
}

/// Commands sent to the session actor
pub(crate) enum SessionCommand {
    ConnectToPeer(UserId, oneshot::Sender<VoiceResult<()>>),
    HandleIncomingOffer(UserId, SessionDescription, oneshot::Sender<VoiceResult<()>>),
    SetTransmitting(bool, oneshot::Sender<()>),
    GetPeerState(UserId, oneshot::Sender<Option<PeerState>>),
    Disconnect(oneshot::Sender<()>),
}

/// Handle to a live peer audio session.
///
/// Returned by `VoiceClient::initialize_session`. Dropping the handle tears
/// the session down the same way `disconnect` does.
pub struct VoiceSession {
    local: UserId,
    channel: ChannelId,
    cmd_tx: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
}

impl VoiceSession {
    pub fn local_user(&self) -> &UserId {
        &self.local
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    async fn send_command(&self, cmd: SessionCommand) -> VoiceResult<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| VoiceError::SessionClosed)
    }

    /// Create a connection to `user` and send it our offer
    pub async fn connect_to_peer(&self, user: impl Into<UserId>) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send_command(SessionCommand::ConnectToPeer(user.into(), tx))
            .await?;
        rx.await.map_err(|_| VoiceError::SessionClosed)?
    }

    /// Answer an offer from `from`
    pub async fn handle_incoming_offer(
        &self,
        from: impl Into<UserId>,
        offer: SessionDescription,
    ) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send_command(SessionCommand::HandleIncomingOffer(from.into(), offer, tx))
            .await?;
        rx.await.map_err(|_| VoiceError::SessionClosed)?
    }

    /// Unmute the outbound track. No renegotiation.
    pub async fn start_transmitting(&self) -> VoiceResult<()> {
        self.set_transmitting(true).await
    }

    /// Mute the outbound track. No renegotiation.
    pub async fn stop_transmitting(&self) -> VoiceResult<()> {
        self.set_transmitting(false).await
    }

    async fn set_transmitting(&self, enabled: bool) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send_command(SessionCommand::SetTransmitting(enabled, tx))
            .await?;
        rx.await.map_err(|_| VoiceError::SessionClosed)
    }

    pub async fn peer_state(&self, user: impl Into<UserId>) -> VoiceResult<Option<PeerState>> {
        let (tx, rx) = oneshot::channel();
        self.send_command(SessionCommand::GetPeerState(user.into(), tx))
            .await?;
        rx.await.map_err(|_| VoiceError::SessionClosed)
    }

    /// Leave the channel, close every peer and release the microphone.
    /// Calling it again is a no-op.
    pub async fn disconnect(&self) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(SessionCommand::Disconnect(tx)).await.is_err() {
            trace!("Session for {} already disconnected", self.local);
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }
}

/// Everything the actor needs, acquired by `VoiceClient` before spawning
pub(crate) struct SessionParts {
    pub local: UserId,
    pub channel: ChannelId,
    pub config: VoiceConfig,
    pub connector: Arc<dyn PeerConnector>,
    pub handler: Arc<dyn VoiceEventHandler>,
    pub capture: LocalCaptureStream,
    pub signaling: SignalingChannel,
    pub notices: NoticeListener,
}

/// Spawn the actor for an initialized session
pub(crate) fn spawn_session(parts: SessionParts) -> VoiceSession {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let mut initial = SessionStatus::disconnected();
    initial.state = ConnectionState::Connected;
    let (status_tx, status_rx) = watch::channel(initial);
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();

    let session = VoiceSession {
        local: parts.local.clone(),
        channel: parts.channel.clone(),
        cmd_tx,
        status: status_rx,
    };

    let now = Instant::now();
    let actor = SessionActor {
        presence: PresenceTracker::new(parts.config.presence_timeout),
        next_heartbeat: now + parts.config.heartbeat_interval,
        local: parts.local,
        config: parts.config,
        connector: parts.connector,
        handler: parts.handler,
        capture: parts.capture,
        signaling: parts.signaling,
        notices: parts.notices,
        peers: HashMap::new(),
        next_connection: 0,
        last_audio: None,
        status: status_tx,
        conn_tx,
        conn_rx,
    };
    tokio::spawn(actor.run(cmd_rx));

    session
}

enum Step {
    Continue,
    Stop(Option<oneshot::Sender<()>>),
}

struct SessionActor {
    local: UserId,
    config: VoiceConfig,
    connector: Arc<dyn PeerConnector>,
    handler: Arc<dyn VoiceEventHandler>,
    capture: LocalCaptureStream,
    signaling: SignalingChannel,
    notices: NoticeListener,
    peers: HashMap<UserId, Peer>,
    next_connection: u64,
    presence: PresenceTracker,
    next_heartbeat: Instant,
    last_audio: Option<Instant>,
    status: watch::Sender<SessionStatus>,
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl SessionActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SessionCommand>) {
        info!("Voice session started for {} on {}", self.local, self.signaling.topic());
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reply = loop {
            let step = tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Disconnect(reply)) => Step::Stop(Some(reply)),
                    Some(cmd) => {
                        self.handle_command(cmd).await;
                        Step::Continue
                    }
                    None => {
                        debug!("Session handle dropped");
                        Step::Stop(None)
                    }
                },
                inbound = self.signaling.next_inbound() => match inbound {
                    Some(inbound) => {
                        self.handle_inbound(inbound).await;
                        Step::Continue
                    }
                    None => {
                        error!("Signaling subscription for {} ended", self.local);
                        Step::Stop(None)
                    }
                },
                Some(event) = self.conn_rx.recv() => {
                    self.handle_connection_event(event).await;
                    Step::Continue
                }
                _ = tick.tick() => {
                    self.housekeeping().await;
                    Step::Continue
                }
            };

            match step {
                Step::Continue => self.publish_status(),
                Step::Stop(reply) => break reply,
            }
        };

        self.shutdown().await;
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::ConnectToPeer(user, reply) => {
                let _ = reply.send(self.connect_to_peer(&user).await);
            }
            SessionCommand::HandleIncomingOffer(from, offer, reply) => {
                let _ = reply.send(self.handle_offer(&from, offer).await);
            }
            SessionCommand::SetTransmitting(enabled, reply) => {
                self.capture.set_enabled(enabled);
                info!(
                    "{} {} transmitting",
                    self.local,
                    if enabled { "started" } else { "stopped" }
                );
                let _ = reply.send(());
            }
            SessionCommand::GetPeerState(user, reply) => {
                let _ = reply.send(self.peers.get(&user).map(Peer::state));
            }
            // Handled by the run loop
            SessionCommand::Disconnect(reply) => {
                let _ = reply.send(());
            }
        }
    }

    /// Note `user` as present, firing `on_peer_joined` the first time
    fn see(&mut self, user: &UserId, now: Instant) {
        if self.presence.join(user, now) {
            info!("{user} joined the voice channel");
            self.handler.on_peer_joined(user);
        }
    }

    /// A live (not closed) peer entry for `user`, replacing a closed one
    fn fresh_peer(&mut self, user: &UserId, now: Instant) -> &mut Peer {
        let peer = self
            .peers
            .entry(user.clone())
            .or_insert_with(|| Peer::new(user.clone(), now));
        if peer.state() == PeerState::Closed {
            *peer = Peer::new(user.clone(), now);
        }
        peer
    }

    async fn ensure_connection(&mut self, user: &UserId) -> Result<(), NegotiationError> {
        let has_connection = self
            .peers
            .get(user)
            .map(Peer::has_connection)
            .unwrap_or(false);
        if has_connection {
            return Ok(());
        }
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        let connection = self
            .connector
            .create(user, id, self.capture.track(), self.conn_tx.clone())
            .await?;
        if let Some(peer) = self.peers.get_mut(user) {
            trace!("Connection {id} to {user}");
            peer.attach(id, connection);
        }
        Ok(())
    }

    async fn connect_to_peer(&mut self, user: &UserId) -> VoiceResult<()> {
        if user == &self.local {
            return Err(VoiceError::Negotiation {
                peer: user.clone(),
                source: NegotiationError::Engine("cannot connect to self".into()),
            });
        }

        let now = Instant::now();
        self.see(user, now);
        if let Some(peer) = self.peers.get(user) {
            if !matches!(peer.state(), PeerState::New | PeerState::Closed) {
                debug!("Already negotiating with {user} ({})", peer.state());
                return Ok(());
            }
        }
        self.fresh_peer(user, now);

        let offer = match self.negotiate_offer(user, now).await {
            Ok(offer) => offer,
            Err(e) => {
                self.fail_peer(user, &e).await;
                return Err(VoiceError::Negotiation {
                    peer: user.clone(),
                    source: e,
                });
            }
        };

        if let Err(e) = self.signaling.send_offer(user, offer).await {
            error!("Offer to {user} not delivered: {e}");
            self.close_peer(user).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn negotiate_offer(
        &mut self,
        user: &UserId,
        now: Instant,
    ) -> Result<SessionDescription, NegotiationError> {
        self.ensure_connection(user).await?;
        match self.peers.get_mut(user) {
            Some(peer) => peer.offer(now).await,
            None => Err(NegotiationError::Engine(format!("no peer state for {user}"))),
        }
    }

    async fn handle_offer(&mut self, from: &UserId, offer: SessionDescription) -> VoiceResult<()> {
        let now = Instant::now();
        self.see(from, now);

        let state = self.peers.get(from).map(Peer::state);
        match state {
            None | Some(PeerState::New) | Some(PeerState::Closed) => {}
            Some(PeerState::OfferSent) => {
                // Both sides offered: the smaller id yields and answers
                if self.local < *from {
                    info!("Offer collision with {from}, yielding");
                    self.close_peer(from).await;
                } else {
                    debug!("Offer collision with {from}, keeping our offer");
                    return Ok(());
                }
            }
            Some(state) => {
                info!("{from} restarted negotiation (was {state})");
                self.close_peer(from).await;
            }
        }
        self.fresh_peer(from, now);

        let answer = match self.negotiate_answer(from, offer, now).await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail_peer(from, &e).await;
                return Err(VoiceError::Negotiation {
                    peer: from.clone(),
                    source: e,
                });
            }
        };

        if let Err(e) = self.signaling.send_answer(from, answer).await {
            error!("Answer to {from} not delivered: {e}");
            self.close_peer(from).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn negotiate_answer(
        &mut self,
        from: &UserId,
        offer: SessionDescription,
        now: Instant,
    ) -> Result<SessionDescription, NegotiationError> {
        self.ensure_connection(from).await?;
        match self.peers.get_mut(from) {
            Some(peer) => peer.answer(offer, now).await,
            None => Err(NegotiationError::Engine(format!("no peer state for {from}"))),
        }
    }

    /// Resolve the sender of an answer that did not name itself
    fn answer_sender(&self, from: Option<UserId>) -> Option<UserId> {
        if from.is_some() {
            return from;
        }
        let mut waiting = self
            .peers
            .values()
            .filter(|p| p.state() == PeerState::OfferSent);
        match (waiting.next(), waiting.next()) {
            (Some(peer), None) => Some(peer.user().clone()),
            (None, _) => {
                debug!("Dropping anonymous answer: no offer outstanding");
                None
            }
            (Some(_), Some(_)) => {
                warn!("Dropping anonymous answer: several offers outstanding");
                None
            }
        }
    }

    async fn handle_answer(&mut self, from: Option<UserId>, answer: SessionDescription) {
        let Some(from) = self.answer_sender(from) else {
            return;
        };
        let now = Instant::now();
        let result = match self.peers.get_mut(&from) {
            Some(peer) if peer.state() == PeerState::OfferSent => {
                peer.accept_answer(answer, now).await
            }
            Some(peer) => {
                debug!("Ignoring answer from {from} in state {}", peer.state());
                return;
            }
            None => {
                debug!("Ignoring answer from {from}: never offered");
                return;
            }
        };
        self.presence.touch(&from, now);
        if let Err(e) = result {
            self.fail_peer(&from, &e).await;
        }
    }

    async fn handle_candidate(&mut self, from: &UserId, candidate: IceCandidate) {
        let now = Instant::now();
        if let Some(peer) = self.peers.get(from) {
            if peer.state() == PeerState::Closed {
                trace!("Dropping candidate for closed peer {from}");
                return;
            }
        }
        self.presence.touch(from, now);
        let peer = self
            .peers
            .entry(from.clone())
            .or_insert_with(|| Peer::new(from.clone(), now));
        if let Err(e) = peer.add_candidate(candidate).await {
            self.fail_peer(from, &e).await;
        }
    }

    async fn handle_joined(&mut self, user: &UserId) {
        let now = Instant::now();
        let is_new = !self.presence.contains(user);
        self.see(user, now);

        let live = self
            .peers
            .get(user)
            .map(|p| p.state() != PeerState::Closed && p.has_connection())
            .unwrap_or(false);
        if live {
            trace!("Heartbeat from {user}");
            return;
        }
        if !is_new {
            debug!("{user} is back without a connection, offering again");
        }
        if let Err(e) = self.connect_to_peer(user).await {
            warn!("Could not connect to {user}: {e}");
        }
    }

    /// Forget `user`: close the peer and fire `on_peer_left` once
    async fn handle_left(&mut self, user: &UserId) {
        let was_present = self.presence.leave(user);
        let had_peer = self.close_peer(user).await;
        if was_present || had_peer {
            info!("{user} left the voice channel");
            self.handler.on_peer_left(user);
        }
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Joined(user) => self.handle_joined(&user).await,
            Inbound::Left(user) => self.handle_left(&user).await,
            Inbound::Offer { from, offer } => {
                if let Err(e) = self.handle_offer(&from, offer).await {
                    warn!("Offer from {from} not answered: {e}");
                }
            }
            Inbound::Answer { from, answer } => self.handle_answer(from, answer).await,
            Inbound::Candidate { from, candidate } => self.handle_candidate(&from, candidate).await,
            Inbound::AudioChunk { from, .. } => {
                trace!("Ignoring fallback audio from {from} on the signaling topic");
            }
            Inbound::VoiceMessage(notice) => self.handler.on_voice_message(&notice),
        }
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        let now = Instant::now();
        let current = self
            .peers
            .get(event.peer())
            .map(|p| p.owns(event.connection()))
            .unwrap_or(false);
        if !current {
            trace!(
                "Dropping event from replaced connection {} to {}",
                event.connection(),
                event.peer()
            );
            return;
        }

        match event {
            ConnectionEvent::LocalCandidate { peer, candidate, .. } => {
                if let Err(e) = self.signaling.send_candidate(&peer, candidate).await {
                    warn!("Candidate for {peer} not delivered: {e}");
                }
            }
            ConnectionEvent::StateChanged { peer, state, .. } => match state {
                MediaState::Connected => {
                    if let Some(p) = self.peers.get_mut(&peer) {
                        match p.transition(PeerTransition::MediaConnected, now) {
                            Ok(_) => info!("Media connected with {peer}"),
                            Err(e) => debug!("Ignoring media state for {peer}: {e}"),
                        }
                    }
                }
                MediaState::Connecting => trace!("Media connecting with {peer}"),
                MediaState::Disconnected => warn!("Media with {peer} interrupted"),
                MediaState::Failed => {
                    let e = NegotiationError::Engine("media connection failed".into());
                    self.fail_peer(&peer, &e).await;
                }
                MediaState::Closed => {
                    self.close_peer(&peer).await;
                }
            },
            ConnectionEvent::RemoteTrack { peer, .. } => {
                if let Some(p) = self.peers.get_mut(&peer) {
                    if p.mark_remote_track() {
                        debug!("Remote track from {peer}");
                        self.handler.on_remote_track(&peer);
                    }
                }
            }
            ConnectionEvent::RemoteAudio { peer, frame, .. } => {
                self.last_audio = Some(now);
                self.presence.touch(&peer, now);
                self.handler.on_audio_received(&peer, &frame);
            }
        }
    }

    /// Close a live peer. Returns false if there was nothing to close.
    async fn close_peer(&mut self, user: &UserId) -> bool {
        match self.peers.get_mut(user) {
            Some(peer) if peer.state() != PeerState::Closed => {
                peer.close(Instant::now()).await;
                true
            }
            _ => false,
        }
    }

    async fn fail_peer(&mut self, user: &UserId, e: &NegotiationError) {
        error!("Negotiation with {user} failed: {e}");
        self.close_peer(user).await;
    }

    async fn housekeeping(&mut self) {
        let now = Instant::now();

        let timeout = self.config.offer_timeout;
        if !timeout.is_zero() {
            let stalled: Vec<UserId> = self
                .peers
                .values()
                .filter(|p| {
                    p.state().is_negotiating() && now.duration_since(p.state_since()) >= timeout
                })
                .map(|p| p.user().clone())
                .collect();
            for user in stalled {
                self.fail_peer(&user, &NegotiationError::Timeout(timeout)).await;
            }
        }

        let heartbeat = self.config.heartbeat_interval;
        if !heartbeat.is_zero() && now >= self.next_heartbeat {
            self.next_heartbeat = now + heartbeat;
            if let Err(e) = self.signaling.announce_presence().await {
                warn!("Presence heartbeat failed: {e}");
            }
        }

        // Peers that only ever sent candidates, with no offer following
        let stray_after = if timeout.is_zero() {
            self.config.presence_timeout
        } else {
            timeout
        };
        if !stray_after.is_zero() {
            let strays: Vec<UserId> = self
                .peers
                .values()
                .filter(|p| {
                    p.state() == PeerState::New && now.duration_since(p.state_since()) >= stray_after
                })
                .map(|p| p.user().clone())
                .collect();
            for user in strays {
                if let Some(mut peer) = self.peers.remove(&user) {
                    debug!(
                        "Forgetting {user}: no offer after {} early candidates",
                        peer.pending_candidates()
                    );
                    peer.close(now).await;
                }
            }
        }

        for user in self.presence.evict_stale(now) {
            warn!("{user} went silent, evicting");
            self.close_peer(&user).await;
            self.handler.on_peer_left(&user);
        }

        // Closed peers linger so late messages for them are dropped
        let linger = self.config.presence_timeout;
        if !linger.is_zero() {
            self.peers.retain(|_, p| {
                p.state() != PeerState::Closed || now.duration_since(p.state_since()) < linger
            });
        }
    }

    fn snapshot(&self) -> SessionStatus {
        let peers: BTreeMap<UserId, PeerState> = self
            .peers
            .iter()
            .map(|(user, peer)| (user.clone(), peer.state()))
            .collect();
        let connected_users: BTreeSet<UserId> = peers
            .iter()
            .filter(|(_, state)| **state == PeerState::Connected)
            .map(|(user, _)| user.clone())
            .collect();
        let negotiating = peers.values().any(PeerState::is_negotiating);

        let state = if connected_users.is_empty() && negotiating {
            ConnectionState::Connecting
        } else {
            ConnectionState::Connected
        };
        let receiving = self
            .last_audio
            .map(|at| at.elapsed() < self.config.receiving_hold)
            .unwrap_or(false);

        SessionStatus {
            state,
            transmitting: self.capture.is_enabled(),
            receiving,
            connected_peer_count: connected_users.len(),
            connected_users,
            participants: self.presence.users(),
            peers,
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
        info!("Disconnecting {} from {}", self.local, self.signaling.topic());
        if let Err(e) = self.signaling.announce_departure().await {
            warn!("Could not announce departure: {e}");
        }

        let now = Instant::now();
        for peer in self.peers.values_mut() {
            peer.close(now).await;
        }
        self.peers.clear();
        self.presence.clear();
        self.capture.stop();

        self.signaling.close().await;
        self.notices.close().await;
        self.status.send_replace(SessionStatus::disconnected());
        info!("Voice session for {} closed", self.local);
    }
}
