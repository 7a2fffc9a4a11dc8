//! Wire vocabulary shared by every voxlink client: identifiers, signaling
//! messages, topic names and the audio fragment codec.

pub mod codec;
pub mod messages;
pub mod topic;

pub use codec::{AudioCodec, DecodeError, PcmFrame};
pub use messages::{
    ChannelId, Envelope, IceCandidate, SdpType, SessionDescription, SignalKind, SignalMessage,
    UserId,
};
pub use topic::Topic;
