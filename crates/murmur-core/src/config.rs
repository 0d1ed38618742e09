//! Feed configuration.
//!
//! Defaults mirror the behaviour of the original web client: kind 1222 voice
//! messages, ten per page, a 24 hour window on the global feed, and short
//! interactive deadlines.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FeedError, Result};
use crate::message::kind;

/// Relays used when the configuration names none.
pub static DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://relay.nostr.band",
    "wss://nos.lol",
];

/// Blossom server used when an author publishes no server list.
pub const DEFAULT_BLOSSOM_SERVER: &str = "https://blossom.band";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Event kind carried by the feed.
    pub kind: u16,
    /// Target page size; an under-full page exhausts the feed.
    pub page_size: usize,
    /// Deadline for pagination and thread queries.
    pub query_timeout_ms: u64,
    /// How far back the global feed reaches. `None` disables the window.
    pub global_window_secs: Option<u64>,
    /// Live poll interval.
    pub poll_interval_secs: u64,
    /// Overlap window for each live poll.
    pub poll_lookback_secs: u64,
    /// Wait after a successful broadcast before looking for the confirmed copy.
    pub settle_delay_ms: u64,
    /// Deadline for the confirmation re-query.
    pub confirm_timeout_ms: u64,
    /// How far back the confirmation re-query looks.
    pub confirm_window_secs: u64,
    /// Deadline for signing and broadcasting a write.
    pub publish_timeout_ms: u64,
    pub relays: Vec<String>,
    pub blossom_servers: Vec<String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            kind: kind::VOICE_MESSAGE,
            page_size: 10,
            query_timeout_ms: 1500,
            global_window_secs: Some(60 * 60 * 24),
            poll_interval_secs: 5,
            poll_lookback_secs: 30,
            settle_delay_ms: 3000,
            confirm_timeout_ms: 2000,
            confirm_window_secs: 30,
            publish_timeout_ms: 5000,
            relays: DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect(),
            blossom_servers: vec![DEFAULT_BLOSSOM_SERVER.to_string()],
        }
    }
}

impl FeedConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FeedError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: FeedConfig =
            serde_json::from_str(raw).map_err(|e| FeedError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall pagination or spin the poller.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(FeedError::Config("page_size must be at least 1".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(FeedError::Config("poll_interval_secs must be at least 1".into()));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = FeedConfig::from_json(r#"{ "page_size": 20 }"#).unwrap();
        assert_eq!(config.page_size, 20);
        assert_eq!(config.kind, 1222);
        assert_eq!(config.global_window_secs, Some(86400));
        assert_eq!(config.query_timeout(), Duration::from_millis(1500));
        assert_eq!(config.publish_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn null_window_disables_it() {
        let config = FeedConfig::from_json(r#"{ "global_window_secs": null }"#).unwrap();
        assert_eq!(config.global_window_secs, None);
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let err = FeedConfig::from_json(r#"{ "page_size": 0 }"#).unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "relays": ["wss://example.relay"], "poll_interval_secs": 9 }}"#).unwrap();

        let config = FeedConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.relays, vec!["wss://example.relay".to_string()]);
        assert_eq!(config.poll_interval(), Duration::from_secs(9));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FeedConfig::from_json_file(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));
    }
}
