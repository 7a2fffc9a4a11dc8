use std::time::Duration;

/// Default STUN servers handed to the peer connector
pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Tunables for voice sessions and the fallback transport
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceConfig {
    /// Capture rate requested from the microphone
    pub sample_rate: u32,
    /// Capture channel count (voice is mono)
    pub channels: u8,
    /// Duration of one fallback fragment
    pub fragment_ms: u32,
    /// How long a peer may wait for an answer before it is closed
    pub offer_timeout: Duration,
    /// Presence re-announcement period. Zero disables heartbeats.
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is evicted. Zero disables eviction.
    pub presence_timeout: Duration,
    /// How long `receiving` stays set after the last inbound audio
    pub receiving_hold: Duration,
    /// Delay before the single retry of a failed subscribe/send
    pub send_retry_backoff: Duration,
    /// STUN/TURN urls
    pub ice_servers: Vec<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            fragment_ms: 100,
            offer_timeout: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(10),
            presence_timeout: Duration::from_secs(30),
            receiving_hold: Duration::from_millis(500),
            send_retry_backoff: Duration::from_millis(250),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl VoiceConfig {
    /// Load overrides from environment variables.
    ///
    /// - `VOXLINK_SAMPLE_RATE`, `VOXLINK_FRAGMENT_MS`
    /// - `VOXLINK_OFFER_TIMEOUT_MS`, `VOXLINK_HEARTBEAT_MS`, `VOXLINK_PRESENCE_TIMEOUT_MS`
    /// - `VOXLINK_RECEIVING_HOLD_MS`, `VOXLINK_RETRY_BACKOFF_MS`
    /// - `VOXLINK_ICE_SERVERS` (comma separated)
    ///
    /// Unset or unparseable values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, fallback: Duration| {
            number(key).map(Duration::from_millis).unwrap_or(fallback)
        };

        let ice_servers = lookup("VOXLINK_ICE_SERVERS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|servers| !servers.is_empty())
            .unwrap_or(defaults.ice_servers.clone());

        Self {
            sample_rate: number("VOXLINK_SAMPLE_RATE")
                .filter(|&r| r > 0)
                .map(|r| r as u32)
                .unwrap_or(defaults.sample_rate),
            channels: defaults.channels,
            fragment_ms: number("VOXLINK_FRAGMENT_MS")
                .filter(|&ms| ms > 0)
                .map(|ms| ms as u32)
                .unwrap_or(defaults.fragment_ms),
            offer_timeout: millis("VOXLINK_OFFER_TIMEOUT_MS", defaults.offer_timeout),
            heartbeat_interval: millis("VOXLINK_HEARTBEAT_MS", defaults.heartbeat_interval),
            presence_timeout: millis("VOXLINK_PRESENCE_TIMEOUT_MS", defaults.presence_timeout),
            receiving_hold: millis("VOXLINK_RECEIVING_HOLD_MS", defaults.receiving_hold),
            send_retry_backoff: millis("VOXLINK_RETRY_BACKOFF_MS", defaults.send_retry_backoff),
            ice_servers,
        }
    }

    /// Samples per channel in one fallback fragment
    pub fn samples_per_fragment(&self) -> usize {
        (self.sample_rate as u64 * self.fragment_ms as u64 / 1000) as usize
    }
}
