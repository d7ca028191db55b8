use anyhow::Error;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    /// How long an unanswered call keeps ringing before a local timeout
    /// hangup, in seconds.
    pub ring_timeout_secs: u64,
    /// Interval of the polling fallback behind the push change feed.
    pub poll_interval_secs: u64,
    /// Lookback window for polling. Records created earlier than this are
    /// never surfaced by the poll; a stale ring is assumed already resolved.
    pub poll_lookback_secs: u64,
    /// Grace period for a disconnected peer connection before the call is
    /// ended with `connection_failed`.
    pub connection_grace_secs: u64,
    /// Attempts for each signaling write before the call is failed.
    pub signaling_write_attempts: u32,
    pub ice_servers: Option<Vec<IceServerItem>>,
}

#[derive(Debug, Deserialize, Default, Serialize, Clone)]
pub struct IceServerItem {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            log_file: None,
            ring_timeout_secs: 45,
            poll_interval_secs: 20,
            poll_lookback_secs: 60,
            connection_grace_secs: 10,
            signaling_write_attempts: 3,
            ice_servers: None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn poll_lookback(&self) -> Duration {
        Duration::from_secs(self.poll_lookback_secs)
    }

    pub fn connection_grace(&self) -> Duration {
        Duration::from_secs(self.connection_grace_secs)
    }

    pub fn ice_servers(&self) -> Vec<IceServerItem> {
        self.ice_servers.clone().unwrap_or_default()
    }
}
