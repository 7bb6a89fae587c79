//! Relay registry.
//!
//! Holds every known relay: the built-in defaults plus the ones a user adds.
//! Only user-added relays are persisted. Relays are never dropped because
//! they fail; a relay that exhausts its retries stays registered as
//! `Abandoned` until removed or explicitly reconnected.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{info, warn};
use url::Url;

use crate::error::{ClientError, Result};
use crate::relay::{ConnectionState, RelayConfig, RelayConnection};
use crate::store::{KeyValueStore, keys};

/// Snapshot of one registered relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub url: String,
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub is_default: bool,
}

/// Validate a relay URL and normalize it for comparison.
///
/// Only `ws` and `wss` are accepted; a trailing `/` is removed.
pub fn normalize_url(url: &str) -> Result<String> {
    let parsed = Url::parse(url.trim())?;
    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        return Err(ClientError::InvalidUrl(format!(
            "URL must use ws:// or wss:// scheme, got: {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none() {
        return Err(ClientError::InvalidUrl(format!("missing host in {}", url)));
    }
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

/// The set of relays a client knows about.
pub struct RelayRegistry {
    relays: RwLock<Vec<Arc<RelayConnection>>>,
    defaults: Vec<String>,
    relay_config: RelayConfig,
    store: Arc<dyn KeyValueStore>,
}

impl RelayRegistry {
    /// Build from built-in defaults plus any persisted user relays.
    pub fn new(
        defaults: &[String],
        relay_config: RelayConfig,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        let mut normalized_defaults = Vec::new();
        let mut relays = Vec::new();

        for url in defaults {
            let url = normalize_url(url)?;
            if !normalized_defaults.contains(&url) {
                relays.push(Arc::new(RelayConnection::with_config(
                    &url,
                    relay_config.clone(),
                )?));
                normalized_defaults.push(url);
            }
        }

        let persisted: Vec<String> = store.get_json(keys::RELAYS)?.unwrap_or_default();
        for raw in persisted {
            let url = match normalize_url(&raw) {
                Ok(url) => url,
                Err(e) => {
                    warn!("Skipping stored relay {}: {}", raw, e);
                    continue;
                }
            };
            if relays.iter().any(|r| r.url_str() == url) {
                continue;
            }
            relays.push(Arc::new(RelayConnection::with_config(
                &url,
                relay_config.clone(),
            )?));
        }

        info!("Relay registry initialized with {} relays", relays.len());
        Ok(Self {
            relays: RwLock::new(relays),
            defaults: normalized_defaults,
            relay_config,
            store,
        })
    }

    pub fn is_default(&self, url: &str) -> bool {
        normalize_url(url)
            .map(|u| self.defaults.contains(&u))
            .unwrap_or(false)
    }

    /// Add a relay. Returns `None` if it was already registered.
    pub async fn add(&self, url: &str) -> Result<Option<Arc<RelayConnection>>> {
        let url = normalize_url(url)?;
        let relay = {
            let mut relays = self.relays.write().await;
            if relays.iter().any(|r| r.url_str() == url) {
                return Ok(None);
            }
            let relay = Arc::new(RelayConnection::with_config(
                &url,
                self.relay_config.clone(),
            )?);
            relays.push(Arc::clone(&relay));
            self.persist(&relays)?;
            relay
        };
        info!("Added relay: {}", url);
        Ok(Some(relay))
    }

    /// Remove a relay and tear down its connection. Returns false if unknown.
    pub async fn remove(&self, url: &str) -> Result<bool> {
        let url = normalize_url(url)?;
        let removed = {
            let mut relays = self.relays.write().await;
            let Some(index) = relays.iter().position(|r| r.url_str() == url) else {
                return Ok(false);
            };
            let relay = relays.remove(index);
            self.persist(&relays)?;
            relay
        };
        removed.disconnect().await;
        info!("Removed relay: {}", url);
        Ok(true)
    }

    /// Remove every user-added relay.
    pub async fn remove_all_custom(&self) -> Result<usize> {
        let removed: Vec<Arc<RelayConnection>> = {
            let mut relays = self.relays.write().await;
            let (keep, custom): (Vec<_>, Vec<_>) = relays
                .drain(..)
                .partition(|r| self.defaults.iter().any(|d| d == r.url_str()));
            *relays = keep;
            self.persist(&relays)?;
            custom
        };
        join_all(removed.iter().map(|r| r.disconnect())).await;
        info!("Removed {} custom relays", removed.len());
        Ok(removed.len())
    }

    pub async fn get(&self, url: &str) -> Option<Arc<RelayConnection>> {
        let url = normalize_url(url).ok()?;
        self.relays
            .read()
            .await
            .iter()
            .find(|r| r.url_str() == url)
            .cloned()
    }

    pub async fn relays(&self) -> Vec<Arc<RelayConnection>> {
        self.relays.read().await.clone()
    }

    pub async fn urls(&self) -> Vec<String> {
        self.relays
            .read()
            .await
            .iter()
            .map(|r| r.url_str().to_string())
            .collect()
    }

    pub async fn endpoints(&self) -> Vec<RelayEndpoint> {
        self.relays
            .read()
            .await
            .iter()
            .map(|r| RelayEndpoint {
                url: r.url_str().to_string(),
                state: r.state(),
                retry_count: r.retry_count(),
                last_error: r.last_error(),
                is_default: self.defaults.iter().any(|d| d == r.url_str()),
            })
            .collect()
    }

    /// Relays currently in the `Connected` state.
    pub async fn connected(&self) -> Vec<Arc<RelayConnection>> {
        self.relays
            .read()
            .await
            .iter()
            .filter(|r| r.is_connected())
            .cloned()
            .collect()
    }

    pub async fn has_connected(&self) -> bool {
        self.relays.read().await.iter().any(|r| r.is_connected())
    }

    /// Connect every relay that is idle. Abandoned relays are skipped.
    ///
    /// Returns the number of relays connected afterwards.
    pub async fn connect_all(&self) -> usize {
        let relays = self.relays().await;
        let idle: Vec<_> = relays
            .iter()
            .filter(|r| r.state() == ConnectionState::Disconnected)
            .collect();

        let results = join_all(idle.iter().map(|r| r.connect())).await;
        for (relay, result) in idle.iter().zip(results) {
            if let Err(e) = result {
                warn!("Initial connect to {} failed: {}", relay.url_str(), e);
            }
        }
        relays.iter().filter(|r| r.is_connected()).count()
    }

    pub async fn disconnect_all(&self) {
        let relays = self.relays().await;
        join_all(relays.iter().map(|r| r.disconnect())).await;
    }

    fn persist(&self, relays: &[Arc<RelayConnection>]) -> Result<()> {
        let custom: Vec<&str> = relays
            .iter()
            .map(|r| r.url_str())
            .filter(|url| !self.defaults.iter().any(|d| d == url))
            .collect();
        self.store.set_json(keys::RELAYS, &custom)?;
        Ok(())
    }
}
