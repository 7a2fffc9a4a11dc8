//! Broadcast topic naming.
//!
//! Each purpose gets its own namespace so unrelated traffic never
//! cross-delivers: signaling on `voice-*` never reaches a fragment
//! listener on `audio-*`.

use crate::messages::{ChannelId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Offer/answer/candidate/presence exchange for one channel
    VoiceSignaling(ChannelId),
    /// Chunked fallback audio for one channel
    AudioFragments(ChannelId),
    /// Voice-message notifications addressed to a channel
    ChannelMessages(ChannelId),
    /// Voice-message notifications addressed to one user
    UserMessages(UserId),
}

impl Topic {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::VoiceSignaling(_) => "voice",
            Self::AudioFragments(_) => "audio",
            Self::ChannelMessages(_) => "channel",
            Self::UserMessages(_) => "user",
        }
    }

    pub fn name(&self) -> String {
        let scope = match self {
            Self::VoiceSignaling(c) | Self::AudioFragments(c) | Self::ChannelMessages(c) => c.as_str(),
            Self::UserMessages(u) => u.as_str(),
        };
        format!("{}-{}", self.prefix(), scope)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        let channel = ChannelId::from("general");
        assert_eq!(Topic::VoiceSignaling(channel.clone()).name(), "voice-general");
        assert_eq!(Topic::AudioFragments(channel.clone()).name(), "audio-general");
        assert_eq!(Topic::ChannelMessages(channel).name(), "channel-general");
        assert_eq!(Topic::UserMessages(UserId::from("u1")).to_string(), "user-u1");
    }

    #[test]
    fn test_namespaces_are_distinct() {
        let channel = ChannelId::from("lobby");
        assert_ne!(
            Topic::VoiceSignaling(channel.clone()).name(),
            Topic::AudioFragments(channel).name()
        );
    }
}
