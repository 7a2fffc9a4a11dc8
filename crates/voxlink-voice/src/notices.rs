//! Voice-message announcements on the channel and personal topics.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use voxlink_protocol::{ChannelId, Topic, UserId};

use crate::error::VoiceResult;
use crate::events::VoiceEventHandler;
use crate::guard::ResourceGuard;
use crate::signaling::{Inbound, SignalingChannel};
use crate::transport::BroadcastTransport;

/// Forwards `voice-message` notifications to the event handler until closed
pub struct NoticeListener {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl NoticeListener {
    /// Listen on `channel-{channel}` and `user-{user}`.
    pub async fn open(
        transport: Arc<dyn BroadcastTransport>,
        guard: &ResourceGuard,
        channel: &ChannelId,
        user: &UserId,
        retry_backoff: Duration,
        handler: Arc<dyn VoiceEventHandler>,
    ) -> VoiceResult<Self> {
        let topics = [
            Topic::ChannelMessages(channel.clone()),
            Topic::UserMessages(user.clone()),
        ];

        // Open both before spawning so a failure leaves nothing behind
        let mut channels = Vec::with_capacity(topics.len());
        for topic in &topics {
            channels.push(
                SignalingChannel::open(
                    transport.clone(),
                    guard,
                    topic,
                    user.clone(),
                    retry_backoff,
                )
                .await?,
            );
        }

        let (stop, _) = watch::channel(false);
        let tasks = channels
            .into_iter()
            .map(|channel| tokio::spawn(listen(channel, stop.subscribe(), handler.clone())))
            .collect();

        Ok(Self { stop, tasks })
    }

    /// Leave both topics
    pub async fn close(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn listen(
    mut channel: SignalingChannel,
    mut stop: watch::Receiver<bool>,
    handler: Arc<dyn VoiceEventHandler>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            inbound = channel.next_inbound() => match inbound {
                Some(Inbound::VoiceMessage(notice)) => {
                    info!(
                        "Voice message {} from {} ({:.1}s)",
                        notice.message_id, notice.sender_id, notice.duration
                    );
                    handler.on_voice_message(&notice);
                }
                Some(other) => debug!("Ignoring {other:?} on {}", channel.topic()),
                None => break,
            },
        }
    }
    channel.close().await;
}
