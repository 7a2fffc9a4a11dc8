//! Read-only view of the profile/channel service.

use voxlink_protocol::{ChannelId, UserId};

/// Who the local user is and which channel they are looking at
pub trait ChannelDirectory: Send + Sync + 'static {
    /// `None` while nobody is signed in
    fn current_user_id(&self) -> Option<UserId>;

    fn active_channel_id(&self) -> ChannelId;
}

/// Fixed identity, for the CLI and tests
#[derive(Debug, Clone)]
pub struct StaticDirectory {
    user: Option<UserId>,
    channel: ChannelId,
}

impl StaticDirectory {
    pub fn new(user: impl Into<UserId>, channel: impl Into<ChannelId>) -> Self {
        Self {
            user: Some(user.into()),
            channel: channel.into(),
        }
    }

    pub fn signed_out(channel: impl Into<ChannelId>) -> Self {
        Self {
            user: None,
            channel: channel.into(),
        }
    }
}

impl ChannelDirectory for StaticDirectory {
    fn current_user_id(&self) -> Option<UserId> {
        self.user.clone()
    }

    fn active_channel_id(&self) -> ChannelId {
        self.channel.clone()
    }
}
