//! Nostr relay client.
//!
//! This crate provides:
//! - WebSocket connections to relays with exponential-backoff reconnects
//! - A persisted relay registry (built-in defaults plus user relays)
//! - Subscriptions multiplexed across relays, deduplicated and verified
//! - [`ProtocolClient`], which ties relays, keys and encryption together
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr::{KeyMaterial, Keys};
//! use nostr_client::{ClientConfig, Filter, ProtocolClient, SubscriptionEvent};
//!
//! #[tokio::main]
//! async fn main() -> nostr_client::Result<()> {
//!     let client = ProtocolClient::with_memory_store(ClientConfig::default())?;
//!     client.set_key_material(KeyMaterial::Local(Keys::generate())).await?;
//!     client.ensure_connected().await?;
//!
//!     let note = client.sign("hello", 1, vec![]).await?;
//!     let published = client.publish(&note).await?;
//!     println!("accepted by {}", published.relay_url);
//!
//!     let mut sub = client.subscribe(vec![Filter::new().kind(1).limit(10)]).await?;
//!     while let Some(item) = sub.next().await {
//!         match item {
//!             SubscriptionEvent::Event { event, .. } => println!("{}", event.content),
//!             SubscriptionEvent::EndOfStoredEvents => break,
//!         }
//!     }
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod error;
mod indexer;
mod message;
mod notifications;
mod registry;
mod relay;
mod store;
mod subscription;

// Re-export main types
pub use client::{DirectMessage, INBOX_LIMIT, Metadata, ProtocolClient, Published};
pub use config::{ClientConfig, DEFAULT_RELAYS};
pub use error::{ClientError, Result};
pub use indexer::{DEFAULT_MAINNET_INDEXER, DEFAULT_TESTNET_INDEXER, IndexerStore, Network};
pub use message::{ClientMessage, Filter, MessageError, RelayMessage};
pub use notifications::NotificationState;
pub use registry::{RelayEndpoint, RelayRegistry, normalize_url};
pub use relay::{
    ConnectionState, PublishConfirmation, RelayConfig, RelayConnection, RelaySubscriptionMessage,
    RetryPolicy,
};
pub use store::{FileStore, KeyValueStore, MemoryStore, StoreError, keys as store_keys};
pub use subscription::{
    SubscriptionEvent, SubscriptionHandle, SubscriptionMultiplexer, SubscriptionTracker,
    generate_subscription_id,
};
