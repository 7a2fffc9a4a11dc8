//! Connection settings for the hosted backend.

use std::time::Duration;

use anyhow::{Context, Result};

/// Phoenix heartbeat period expected by the realtime service
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(25);
/// How long a topic join may wait for its reply
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Realtime broadcast service (`VOXLINK_REALTIME_URL`, `VOXLINK_API_KEY`)
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Websocket base, e.g. `wss://project.supabase.co/realtime/v1`
    pub url: String,
    pub api_key: String,
    pub heartbeat_interval: Duration,
    pub join_timeout: Duration,
}

impl RealtimeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let url = lookup("VOXLINK_REALTIME_URL").context("VOXLINK_REALTIME_URL is not set")?;
        let api_key = lookup("VOXLINK_API_KEY").context("VOXLINK_API_KEY is not set")?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            api_key,
            heartbeat_interval: DEFAULT_HEARTBEAT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        })
    }

    /// Full websocket endpoint including the Phoenix protocol parameters
    pub fn endpoint(&self) -> String {
        format!("{}/websocket?apikey={}&vsn=1.0.0", self.url, self.api_key)
    }
}

/// Serverless functions host (`VOXLINK_FUNCTIONS_URL`, `VOXLINK_API_KEY`)
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub functions_url: String,
    pub api_key: String,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let functions_url =
            lookup("VOXLINK_FUNCTIONS_URL").context("VOXLINK_FUNCTIONS_URL is not set")?;
        let api_key = lookup("VOXLINK_API_KEY").context("VOXLINK_API_KEY is not set")?;
        Ok(Self {
            functions_url: functions_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn endpoint(&self, function: &str) -> String {
        format!("{}/{}", self.functions_url, function)
    }
}
