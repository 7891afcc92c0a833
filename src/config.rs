use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::{
    DEFAULT_FRAME_TIMEOUT, DEFAULT_PAIRING_TIMEOUT, DEFAULT_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_BACKOFF, DEFAULT_RECONNECT_MAX_BACKOFF, DEFAULT_STORAGE_PREFIX,
};
use crate::error::{Error, Result};
use crate::utils::backoff_delay;

/// dApp metadata sent along with WalletConnect proposals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub description: String,
    pub url: String,
    pub icons: Vec<String>,
}

/// Retry schedule for WalletConnect transport drops. The delay doubles from
/// `initial_backoff` up to `max_backoff`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    #[serde(with = "millis")]
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            initial_backoff: DEFAULT_RECONNECT_BACKOFF,
            max_backoff: DEFAULT_RECONNECT_MAX_BACKOFF,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt`, counting from 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        backoff_delay(self.initial_backoff, self.max_backoff, attempt)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(with = "millis")]
    pub pairing_timeout: Duration,
    #[serde(with = "millis")]
    pub frame_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub storage_prefix: String,
    pub metadata: Metadata,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pairing_timeout: DEFAULT_PAIRING_TIMEOUT,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            storage_prefix: DEFAULT_STORAGE_PREFIX.to_string(),
            metadata: Metadata::default(),
        }
    }
}

impl Config {
    /// Defaults overridden by `APPKIT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(secs) = parse_var::<u64>(&lookup, "APPKIT_PAIRING_TIMEOUT_SECS")? {
            config.pairing_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "APPKIT_FRAME_TIMEOUT_SECS")? {
            config.frame_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, "APPKIT_RECONNECT_ATTEMPTS")? {
            config.reconnect.max_attempts = attempts;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "APPKIT_RECONNECT_BACKOFF_MS")? {
            config.reconnect.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(prefix) = lookup("APPKIT_STORAGE_PREFIX") {
            config.storage_prefix = prefix;
        }
        Ok(config)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::InternalError(format!("{key} is not a valid number: {raw:?}"))),
    }
}

mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
