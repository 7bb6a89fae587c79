//! Index-service endpoints per network.
//!
//! Each network keeps an ordered list of indexer URLs and an optional
//! primary. The first access seeds an empty list with the built-in default
//! and makes it primary.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::store::{KeyValueStore, keys};

pub const DEFAULT_MAINNET_INDEXER: &str = "https://btc.indexer.angor.io/";
pub const DEFAULT_TESTNET_INDEXER: &str = "https://tbtc.indexer.angor.io/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn default_indexer(self) -> &'static str {
        match self {
            Network::Mainnet => DEFAULT_MAINNET_INDEXER,
            Network::Testnet => DEFAULT_TESTNET_INDEXER,
        }
    }

    fn list_key(self) -> &'static str {
        match self {
            Network::Mainnet => keys::MAINNET_INDEXERS,
            Network::Testnet => keys::TESTNET_INDEXERS,
        }
    }

    fn primary_key(self) -> &'static str {
        match self {
            Network::Mainnet => keys::MAINNET_PRIMARY_INDEXER,
            Network::Testnet => keys::TESTNET_PRIMARY_INDEXER,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => f.write_str("mainnet"),
            Network::Testnet => f.write_str("testnet"),
        }
    }
}

/// Persisted indexer lists.
#[derive(Clone)]
pub struct IndexerStore {
    store: Arc<dyn KeyValueStore>,
}

impl IndexerStore {
    /// Wrap `store`, seeding defaults for any network with no indexers.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let indexers = Self { store };
        for network in [Network::Mainnet, Network::Testnet] {
            if indexers.list(network)?.is_empty() {
                debug!("Seeding default {} indexer", network);
                indexers.add(network, network.default_indexer())?;
                indexers.set_primary(network, network.default_indexer())?;
            }
        }
        Ok(indexers)
    }

    pub fn list(&self, network: Network) -> Result<Vec<String>> {
        Ok(self
            .store
            .get_json(network.list_key())?
            .unwrap_or_default())
    }

    /// Append `url` unless already present.
    pub fn add(&self, network: Network, url: &str) -> Result<bool> {
        let mut list = self.list(network)?;
        if list.iter().any(|u| u == url) {
            return Ok(false);
        }
        list.push(url.to_string());
        self.store.set_json(network.list_key(), &list)?;
        Ok(true)
    }

    /// Remove `url`; clears the primary if it was the primary.
    pub fn remove(&self, network: Network, url: &str) -> Result<bool> {
        let mut list = self.list(network)?;
        let Some(index) = list.iter().position(|u| u == url) else {
            return Ok(false);
        };
        list.remove(index);
        self.store.set_json(network.list_key(), &list)?;
        if self.primary(network)?.as_deref() == Some(url) {
            self.store.remove(network.primary_key())?;
        }
        Ok(true)
    }

    /// Make `url` primary. Ignored unless `url` is in the list.
    pub fn set_primary(&self, network: Network, url: &str) -> Result<bool> {
        if !self.list(network)?.iter().any(|u| u == url) {
            return Ok(false);
        }
        self.store.set(network.primary_key(), url)?;
        Ok(true)
    }

    pub fn primary(&self, network: Network) -> Result<Option<String>> {
        Ok(self.store.get(network.primary_key())?)
    }

    /// Drop every indexer and the primary for `network`.
    pub fn clear(&self, network: Network) -> Result<()> {
        self.store.remove(network.list_key())?;
        self.store.remove(network.primary_key())?;
        Ok(())
    }
}
