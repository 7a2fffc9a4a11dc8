//! Voice core: peer audio sessions, the chunked broadcast fallback, serialized
//! playback and voice messages, over pluggable transport and media seams.

pub mod client;
pub mod config;
pub mod connector;
pub mod directory;
pub mod error;
pub mod events;
pub mod fallback;
pub mod guard;
pub mod media;
pub mod notices;
pub mod peer;
pub mod playback;
pub mod presence;
pub mod recorder;
pub mod session;
pub mod signaling;
pub mod transport;
#[cfg(feature = "webrtc")]
pub mod webrtc_connector;

pub use client::VoiceClient;
pub use config::VoiceConfig;
pub use connector::{
    ConnectionEvent, ConnectionEvents, ConnectionId, MediaState, PeerConnection, PeerConnector,
};
pub use directory::{ChannelDirectory, StaticDirectory};
pub use error::{MediaAccessError, NegotiationError, TransportError, VoiceError, VoiceResult};
pub use events::{ChannelEventHandler, VoiceEvent, VoiceEventHandler, VoiceMessageNotice};
pub use fallback::{FallbackSession, FallbackStatus};
pub use guard::ResourceGuard;
pub use media::{CaptureConstraints, CaptureSource, LocalCaptureStream, LocalTrack, MediaDevices};
pub use peer::PeerState;
pub use playback::{AudioOutput, Fragment, PlaybackError, PlaybackPhase, PlaybackQueue};
pub use recorder::{
    format_duration, RecorderError, RecorderState, RelayError, SendVoiceMessageReceipt,
    SendVoiceMessageRequest, VoiceMessageDraft, VoiceMessageRecorder, VoiceMessageRelay,
    VoiceMessageTarget,
};
pub use session::{ConnectionState, SessionStatus, VoiceSession};
pub use transport::{BroadcastTransport, LocalBroadcastHub, Publisher, Subscription};
#[cfg(feature = "webrtc")]
pub use webrtc_connector::WebRtcConnector;
