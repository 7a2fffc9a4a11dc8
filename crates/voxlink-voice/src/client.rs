//! Entry point: wires the platform seams together and hands out sessions.

use std::sync::Arc;

use tracing::{info, warn};

use voxlink_protocol::Topic;

use crate::config::VoiceConfig;
use crate::connector::PeerConnector;
use crate::directory::ChannelDirectory;
use crate::error::{VoiceError, VoiceResult};
use crate::events::VoiceEventHandler;
use crate::fallback::{spawn_fallback, FallbackParts, FallbackSession};
use crate::guard::ResourceGuard;
use crate::media::{CaptureConstraints, LocalCaptureStream, MediaDevices};
use crate::notices::NoticeListener;
use crate::playback::{AudioOutput, PlaybackQueue};
use crate::session::{spawn_session, SessionParts, VoiceSession};
use crate::signaling::SignalingChannel;
use crate::transport::BroadcastTransport;

/// A voice client for one signed-in user.
///
/// Peer sessions and fallback sessions both acquire the microphone through
/// the client's resource guard, so only one of them can be live at a time.
pub struct VoiceClient {
    devices: Arc<dyn MediaDevices>,
    transport: Arc<dyn BroadcastTransport>,
    directory: Arc<dyn ChannelDirectory>,
    connector: Option<Arc<dyn PeerConnector>>,
    guard: ResourceGuard,
    config: VoiceConfig,
}

impl VoiceClient {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        transport: Arc<dyn BroadcastTransport>,
        directory: Arc<dyn ChannelDirectory>,
    ) -> Self {
        Self {
            devices,
            transport,
            directory,
            connector: None,
            guard: ResourceGuard::new(),
            config: VoiceConfig::default(),
        }
    }

    pub fn with_config(mut self, config: VoiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Media engine for peer sessions
    pub fn with_connector(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    pub fn guard(&self) -> &ResourceGuard {
        &self.guard
    }

    /// Acquire the microphone, join the channel's signaling topic and
    /// announce ourselves.
    ///
    /// Fails with `AlreadyInitialized` while another session holds the
    /// microphone. On any failure everything acquired so far is released.
    pub async fn initialize_session(
        &self,
        handler: Arc<dyn VoiceEventHandler>,
    ) -> VoiceResult<VoiceSession> {
        let connector = self.connector.clone().ok_or(VoiceError::NoPeerConnector)?;
        let local = self.directory.current_user_id().ok_or(VoiceError::NoCurrentUser)?;
        let channel = self.directory.active_channel_id();
        let backoff = self.config.send_retry_backoff;

        let capture = LocalCaptureStream::acquire(
            self.devices.as_ref(),
            &self.guard,
            connector.capture_constraints(&self.config),
        )
        .await?;

        let signaling = SignalingChannel::open(
            self.transport.clone(),
            &self.guard,
            &Topic::VoiceSignaling(channel.clone()),
            local.clone(),
            backoff,
        )
        .await?;

        let notices = match NoticeListener::open(
            self.transport.clone(),
            &self.guard,
            &channel,
            &local,
            backoff,
            handler.clone(),
        )
        .await
        {
            Ok(notices) => notices,
            Err(e) => {
                signaling.close().await;
                return Err(e);
            }
        };

        if let Err(e) = signaling.announce_presence().await {
            warn!("Could not announce {local} on {}: {e}", signaling.topic());
            signaling.close().await;
            notices.close().await;
            return Err(e.into());
        }

        info!("{local} joined voice channel {channel}");
        Ok(spawn_session(SessionParts {
            local,
            channel,
            config: self.config.clone(),
            connector,
            handler,
            capture,
            signaling,
            notices,
        }))
    }

    /// Like `initialize_session`, but audio travels as broadcast fragments
    /// on the channel's audio topic and plays through `output`.
    pub async fn initialize_fallback(
        &self,
        output: Arc<dyn AudioOutput>,
        handler: Arc<dyn VoiceEventHandler>,
    ) -> VoiceResult<FallbackSession> {
        let local = self.directory.current_user_id().ok_or(VoiceError::NoCurrentUser)?;
        let channel = self.directory.active_channel_id();
        let backoff = self.config.send_retry_backoff;

        let mut constraints = CaptureConstraints::voice(self.config.sample_rate);
        constraints.channels = self.config.channels;
        let capture = LocalCaptureStream::acquire(self.devices.as_ref(), &self.guard, constraints)
            .await?;

        let audio = SignalingChannel::open(
            self.transport.clone(),
            &self.guard,
            &Topic::AudioFragments(channel.clone()),
            local.clone(),
            backoff,
        )
        .await?;

        let notices = match NoticeListener::open(
            self.transport.clone(),
            &self.guard,
            &channel,
            &local,
            backoff,
            handler.clone(),
        )
        .await
        {
            Ok(notices) => notices,
            Err(e) => {
                audio.close().await;
                return Err(e);
            }
        };

        if let Err(e) = audio.announce_presence().await {
            warn!("Could not announce {local} on {}: {e}", audio.topic());
            audio.close().await;
            notices.close().await;
            return Err(e.into());
        }

        info!("{local} joined fallback audio for {channel}");
        Ok(spawn_fallback(FallbackParts {
            local,
            channel,
            config: self.config.clone(),
            queue: PlaybackQueue::new(output, handler.clone()),
            handler,
            capture,
            audio,
            notices,
        }))
    }
}
