//! Client configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};
use crate::relay::{RelayConfig, RetryPolicy};

/// Built-in relays; never persisted as user relays.
pub const DEFAULT_RELAYS: &[&str] = &["wss://relay.angor.io", "wss://relay2.angor.io"];

/// Client configuration, stored as TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Built-in relays
    pub relays: Vec<String>,
    /// Per-attempt WebSocket connect timeout
    pub connect_timeout_ms: u64,
    /// Delay before the first retry
    pub retry_initial_interval_ms: u64,
    /// Growth factor between consecutive retry delays
    pub retry_multiplier: f64,
    /// Retries after the first failed attempt before a relay is abandoned
    pub max_retries: u32,
    /// How long to wait for a relay's OK after publishing
    pub publish_timeout_ms: u64,
    /// Upper bound on waiting for any relay to connect
    pub connect_wait_ms: u64,
    /// How often the connectivity wait re-checks relay states
    pub connect_poll_interval_ms: u64,
    /// Deadline for one-shot queries (metadata, follows, history)
    pub query_timeout_ms: u64,
    /// Drop incoming events whose id or signature does not verify
    pub verify_events: bool,
    /// Buffer size of a subscription's consumer channel
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect(),
            connect_timeout_ms: 10_000,
            retry_initial_interval_ms: 5_000,
            retry_multiplier: 2.0,
            max_retries: 5,
            publish_timeout_ms: 10_000,
            connect_wait_ms: 30_000,
            connect_poll_interval_ms: 1_000,
            query_timeout_ms: 10_000,
            verify_events: true,
            channel_capacity: 1024,
        }
    }
}

impl ClientConfig {
    /// Load config from the default path, or return defaults if absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load config from `path`, or return defaults if absent.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make backoff stall or shrink.
    pub fn validate(&self) -> Result<()> {
        if !self.retry_multiplier.is_finite() || self.retry_multiplier <= 1.0 {
            return Err(ClientError::Config(format!(
                "retry_multiplier must be a finite number greater than 1, got {}",
                self.retry_multiplier
            )));
        }
        if self.retry_initial_interval_ms == 0 {
            return Err(ClientError::Config(
                "retry_initial_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Save config to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ClientError::Config(format!("{}: {}", parent.display(), e)))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ClientError::Config(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Default config file path.
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| ClientError::Config("could not determine config directory".into()))?;
        Ok(config_dir.join("nostr-client").join("config.toml"))
    }

    pub fn with_relays(mut self, relays: Vec<String>) -> Self {
        self.relays = relays;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(self.retry_initial_interval_ms),
            multiplier: self.retry_multiplier,
            max_retries: self.max_retries,
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            retry: self.retry_policy(),
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn connect_wait(&self) -> Duration {
        Duration::from_millis(self.connect_wait_ms)
    }

    pub fn connect_poll_interval(&self) -> Duration {
        Duration::from_millis(self.connect_poll_interval_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.relays, DEFAULT_RELAYS);
        assert_eq!(config.relay_config().retry.max_retries, 5);
        assert_eq!(config.connect_poll_interval(), Duration::from_secs(1));
        assert!(config.verify_events);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            relays = ["wss://only.example"]
            max_retries = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.relays, vec!["wss://only.example"]);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.publish_timeout_ms, 10_000);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("client").join("config.toml");

        let config = ClientConfig {
            retry_multiplier: 1.5,
            verify_events: false,
            ..ClientConfig::default()
        };
        config.save_to(&path).unwrap();

        assert_eq!(ClientConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_retry_multiplier_must_grow() {
        for multiplier in [1.0, 0.5, -2.0, f64::INFINITY, f64::NAN] {
            let config = ClientConfig {
                retry_multiplier: multiplier,
                ..ClientConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(ClientError::Config(_))),
                "multiplier {} accepted",
                multiplier
            );
        }
        let zero_interval = ClientConfig {
            retry_initial_interval_ms: 0,
            ..ClientConfig::default()
        };
        assert!(zero_interval.validate().is_err());
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_load_rejects_infinite_multiplier() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "retry_multiplier = inf").unwrap();
        assert!(matches!(
            ClientConfig::load_from(&path),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let config = ClientConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "max_retries = \"many\"").unwrap();
        assert!(matches!(
            ClientConfig::load_from(&path),
            Err(ClientError::Config(_))
        ));
    }
}
