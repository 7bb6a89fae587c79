//! Protocol client façade.
//!
//! [`ProtocolClient`] owns the relay registry, the subscription multiplexer,
//! the active key material and the persisted client state. Callers construct
//! one and pass it around; there is no global instance.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use nostr::{
    DECRYPTION_PLACEHOLDER, Event, KIND_CONTACTS, KIND_ENCRYPTED_DIRECT_MESSAGE, KIND_METADATA,
    KeyMaterial, KeyVault, NostrSigner, build_event, sort_events, verify_event,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::indexer::IndexerStore;
use crate::message::Filter;
use crate::notifications::NotificationState;
use crate::registry::{RelayEndpoint, RelayRegistry};
use crate::store::{KeyValueStore, MemoryStore, keys};
use crate::subscription::{SubscriptionHandle, SubscriptionMultiplexer};

/// Kind 0 profile content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

/// A decrypted kind 4 message between the local user and one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectMessage {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub created_at: u64,
    /// Plaintext, or [`DECRYPTION_PLACEHOLDER`] if it could not be decrypted
    pub content: String,
    /// Sent by the local user
    pub outgoing: bool,
}

/// How many received messages [`ProtocolClient::fetch_inbox`] asks for.
pub const INBOX_LIMIT: u64 = 50;

/// The relay that accepted a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub event_id: String,
    pub relay_url: String,
}

pub struct ProtocolClient {
    config: ClientConfig,
    registry: Arc<RelayRegistry>,
    multiplexer: SubscriptionMultiplexer,
    store: Arc<dyn KeyValueStore>,
    key_material: RwLock<Option<KeyMaterial>>,
    indexers: IndexerStore,
    notifications: NotificationState,
}

impl ProtocolClient {
    /// Build a client over `store`. Nothing connects until asked to.
    ///
    /// A previously persisted encrypted key is restored in its locked form.
    pub fn new(config: ClientConfig, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        config.validate()?;
        let registry = RelayRegistry::new(
            &config.relays,
            config.relay_config(),
            Arc::clone(&store),
        )?;
        let multiplexer = SubscriptionMultiplexer::new(config.verify_events, config.channel_capacity);

        let key_material = match (
            store.get(keys::ENCRYPTED_KEY)?,
            store.get(keys::PUBLIC_KEY)?,
        ) {
            (Some(blob), Some(public_key)) => {
                debug!("Restored encrypted key for {}", public_key);
                Some(KeyMaterial::Encrypted { blob, public_key })
            }
            _ => None,
        };

        Ok(Self {
            indexers: IndexerStore::new(Arc::clone(&store))?,
            notifications: NotificationState::load(Arc::clone(&store))?,
            registry: Arc::new(registry),
            multiplexer,
            store,
            key_material: RwLock::new(key_material),
            config,
        })
    }

    /// Client with nothing persisted beyond the process.
    pub fn with_memory_store(config: ClientConfig) -> Result<Self> {
        Self::new(config, Arc::new(MemoryStore::new()))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RelayRegistry> {
        &self.registry
    }

    pub fn indexers(&self) -> &IndexerStore {
        &self.indexers
    }

    pub fn notifications(&self) -> &NotificationState {
        &self.notifications
    }

    // Relays

    /// Register a relay and start connecting to it in the background.
    ///
    /// Returns false if the relay was already registered.
    pub async fn add_relay(&self, url: &str) -> Result<bool> {
        let Some(relay) = self.registry.add(url).await? else {
            return Ok(false);
        };
        tokio::spawn(async move {
            if let Err(e) = relay.connect().await {
                warn!("Connect to new relay {} failed: {}", relay.url_str(), e);
            }
        });
        Ok(true)
    }

    pub async fn remove_relay(&self, url: &str) -> Result<bool> {
        self.registry.remove(url).await
    }

    pub async fn relays(&self) -> Vec<RelayEndpoint> {
        self.registry.endpoints().await
    }

    /// Connect every idle relay. Returns how many are connected afterwards.
    pub async fn connect(&self) -> usize {
        let connected = self.registry.connect_all().await;
        info!("Connected to {} relays", connected);
        connected
    }

    /// Wait until at least one relay is connected.
    ///
    /// Idle relays are connected in the background while waiting. Fails
    /// with [`ClientError::Timeout`] once `connect_wait` has elapsed.
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.registry.has_connected().await {
            return Ok(());
        }

        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            registry.connect_all().await;
        });

        let wait = self.config.connect_wait();
        let poll = self.config.connect_poll_interval();
        let waited = tokio::time::timeout(wait, async {
            while !self.registry.has_connected().await {
                tokio::time::sleep(poll).await;
            }
        })
        .await;

        waited.map_err(|_| ClientError::Timeout(format!("no relay connected within {:?}", wait)))
    }

    /// Disconnect every relay.
    pub async fn shutdown(&self) {
        self.registry.disconnect_all().await;
        info!("Client shut down");
    }

    // Subscriptions and publishing

    /// Open `filters` on every connected relay.
    ///
    /// Does not wait for connectivity; fails with
    /// [`ClientError::NoConnectedRelays`] when nothing is connected.
    pub async fn subscribe(&self, filters: Vec<Filter>) -> Result<SubscriptionHandle> {
        let relays = self.registry.connected().await;
        self.multiplexer.subscribe(&relays, filters)
    }

    /// Close a subscription on every relay it was opened on.
    pub fn unsubscribe(&self, mut handle: SubscriptionHandle) {
        handle.close();
    }

    /// Send `event` to every connected relay; the first relay to accept it
    /// wins. Fails only once every relay has rejected, errored, or timed out.
    pub async fn publish(&self, event: &Event) -> Result<Published> {
        self.ensure_connected().await?;
        let relays = self.registry.connected().await;
        if relays.is_empty() {
            return Err(ClientError::NoConnectedRelays);
        }

        let confirmation_timeout = self.config.publish_timeout();
        let mut attempts: FuturesUnordered<_> = relays
            .iter()
            .map(|relay| async move {
                let result = relay.publish_event(event, confirmation_timeout).await;
                (relay.url_str(), result)
            })
            .collect();

        let mut failures = Vec::new();
        while let Some((relay_url, result)) = attempts.next().await {
            match result {
                Ok(confirmation) if confirmation.accepted => {
                    info!("Event {} accepted by {}", event.id, relay_url);
                    return Ok(Published {
                        event_id: event.id.clone(),
                        relay_url: relay_url.to_string(),
                    });
                }
                Ok(confirmation) => {
                    let rejected = ClientError::PublishRejected {
                        relay: relay_url.to_string(),
                        message: confirmation.message,
                    };
                    warn!("{}", rejected);
                    failures.push(rejected.to_string());
                }
                Err(e) => {
                    warn!("Publish to {} failed: {}", relay_url, e);
                    failures.push(format!("{}: {}", relay_url, e));
                }
            }
        }

        Err(ClientError::PublishFailed {
            event_id: event.id.clone(),
            failures,
        })
    }

    // Keys

    /// Replace the active key material and persist what can be persisted.
    ///
    /// Only the encrypted form keeps a secret on disk; local and external
    /// material persist the public key alone.
    pub async fn set_key_material(&self, material: KeyMaterial) -> Result<()> {
        let public_key = material.public_key().await?;
        match &material {
            KeyMaterial::Encrypted { blob, .. } => self.store.set(keys::ENCRYPTED_KEY, blob)?,
            _ => self.store.remove(keys::ENCRYPTED_KEY)?,
        }
        self.store.set(keys::PUBLIC_KEY, &public_key)?;
        *self.key_material.write().await = Some(material);
        info!("Key material set for {}", public_key);
        Ok(())
    }

    /// Forget the active key material, in memory and on disk.
    pub async fn clear_key_material(&self) -> Result<()> {
        self.store.remove(keys::ENCRYPTED_KEY)?;
        self.store.remove(keys::PUBLIC_KEY)?;
        *self.key_material.write().await = None;
        Ok(())
    }

    /// Decrypt encrypted key material with `password`.
    pub async fn unlock(&self, vault: &dyn KeyVault, password: &str) -> Result<()> {
        let mut guard = self.key_material.write().await;
        let unlocked = guard
            .as_ref()
            .ok_or(ClientError::NoKeyMaterial)?
            .unlock(vault, password)?;
        *guard = Some(unlocked);
        Ok(())
    }

    pub async fn is_locked(&self) -> bool {
        self.key_material
            .read()
            .await
            .as_ref()
            .is_some_and(KeyMaterial::is_locked)
    }

    pub async fn public_key(&self) -> Result<String> {
        Ok(self.material().await?.public_key().await?)
    }

    async fn material(&self) -> Result<KeyMaterial> {
        self.key_material
            .read()
            .await
            .clone()
            .ok_or(ClientError::NoKeyMaterial)
    }

    async fn signer(&self) -> Result<Arc<dyn NostrSigner>> {
        Ok(self.material().await?.signer()?)
    }

    /// Build and sign an event with the active key material.
    pub async fn sign(
        &self,
        content: impl Into<String>,
        kind: u16,
        tags: Vec<Vec<String>>,
    ) -> Result<Event> {
        let signer = self.signer().await?;
        let pubkey = signer.public_key().await?;
        let event = signer
            .sign_event(build_event(content, kind, tags, pubkey))
            .await?;
        if !verify_event(&event) {
            return Err(ClientError::SigningFailed(format!(
                "signer returned an invalid event {}",
                event.id
            )));
        }
        Ok(event)
    }

    /// Encrypt `plaintext` for `recipient_pubkey`.
    pub async fn encrypt(&self, recipient_pubkey: &str, plaintext: &str) -> Result<String> {
        let signer = self.signer().await?;
        Ok(signer.nip04_encrypt(recipient_pubkey, plaintext).await?)
    }

    /// Decrypt an envelope from `sender_pubkey`.
    pub async fn decrypt(&self, sender_pubkey: &str, envelope: &str) -> Result<String> {
        let signer = self.signer().await?;
        Ok(signer.nip04_decrypt(sender_pubkey, envelope).await?)
    }

    /// Like [`decrypt`](Self::decrypt), degrading to a placeholder.
    pub async fn decrypt_or_placeholder(&self, sender_pubkey: &str, envelope: &str) -> String {
        match self.decrypt(sender_pubkey, envelope).await {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!("Showing placeholder for message from {}: {}", sender_pubkey, e);
                DECRYPTION_PLACEHOLDER.to_string()
            }
        }
    }

    pub fn verify(&self, event: &Event) -> bool {
        verify_event(event)
    }

    // Queries

    /// Stored events matching `filters`, gathered until every relay has
    /// sent EOSE or the query timeout passes.
    pub async fn query(&self, filters: Vec<Filter>) -> Result<Vec<Event>> {
        self.ensure_connected().await?;
        let mut handle = self.subscribe(filters).await?;
        Ok(handle.collect_until_eose(self.config.query_timeout()).await)
    }

    /// Profile metadata of `pubkey`, if any relay has it.
    pub async fn fetch_metadata(&self, pubkey: &str) -> Result<Option<Metadata>> {
        self.ensure_connected().await?;
        let filter = Filter::new().author(pubkey).kind(KIND_METADATA).limit(1);
        let mut handle = self.subscribe(vec![filter]).await?;
        let found = handle
            .first_matching(self.config.query_timeout(), |e| {
                e.pubkey == pubkey && e.kind == KIND_METADATA
            })
            .await;
        let Some(event) = found else {
            return Ok(None);
        };

        match serde_json::from_str(&event.content) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) => {
                warn!("Ignoring unparsable metadata {}: {}", event.id, e);
                Ok(None)
            }
        }
    }

    /// Events authored by `pubkey`, newest first. Empty `kinds` means any.
    pub async fn fetch_events_by_author(&self, pubkey: &str, kinds: &[u16]) -> Result<Vec<Event>> {
        let mut filter = Filter::new().author(pubkey);
        if !kinds.is_empty() {
            filter = filter.kinds(kinds.to_vec());
        }
        let mut events = self.query(vec![filter]).await?;
        events.retain(|e| e.pubkey == pubkey && (kinds.is_empty() || kinds.contains(&e.kind)));
        sort_events(&mut events);
        Ok(events)
    }

    /// Authors of contact lists that include `pubkey`.
    pub async fn fetch_followers(&self, pubkey: &str) -> Result<Vec<String>> {
        let filter = Filter::new()
            .kind(KIND_CONTACTS)
            .pubkey_refs(vec![pubkey.to_string()]);
        let events = self.query(vec![filter]).await?;

        let mut seen = HashSet::new();
        Ok(events
            .into_iter()
            .filter(|e| e.kind == KIND_CONTACTS && e.tag_values("p").any(|pk| pk == pubkey))
            .map(|e| e.pubkey)
            .filter(|author| seen.insert(author.clone()))
            .collect())
    }

    /// Pubkeys in the newest contact list of `pubkey`.
    pub async fn fetch_following(&self, pubkey: &str) -> Result<Vec<String>> {
        let filter = Filter::new().author(pubkey).kind(KIND_CONTACTS);
        let mut events = self.query(vec![filter]).await?;
        events.retain(|e| e.pubkey == pubkey && e.kind == KIND_CONTACTS);
        sort_events(&mut events);
        let Some(contacts) = events.first() else {
            return Ok(Vec::new());
        };

        let mut seen = HashSet::new();
        Ok(contacts
            .tag_values("p")
            .filter(|pk| seen.insert(*pk))
            .map(str::to_string)
            .collect())
    }

    /// Conversation with `peer`, both directions, oldest first.
    pub async fn fetch_direct_messages(&self, peer: &str) -> Result<Vec<DirectMessage>> {
        let me = self.public_key().await?;
        let sent = Filter::new()
            .kind(KIND_ENCRYPTED_DIRECT_MESSAGE)
            .author(me.as_str())
            .pubkey_refs(vec![peer.to_string()]);
        let received = Filter::new()
            .kind(KIND_ENCRYPTED_DIRECT_MESSAGE)
            .author(peer)
            .pubkey_refs(vec![me.clone()]);
        let events = self.query(vec![sent, received]).await?;

        let mut messages = Vec::with_capacity(events.len());
        for event in events {
            if !is_direct_message(&event, &me, peer) && !is_direct_message(&event, peer, &me) {
                debug!("Dropping off-filter event {} in conversation with {}", event.id, peer);
                continue;
            }
            let outgoing = event.pubkey == me;
            // Both directions share the same ECDH secret with `peer`.
            let content = self.decrypt_or_placeholder(peer, &event.content).await;
            let (sender, recipient) = if outgoing {
                (me.clone(), peer.to_string())
            } else {
                (peer.to_string(), me.clone())
            };
            messages.push(DirectMessage {
                id: event.id,
                sender,
                recipient,
                created_at: event.created_at,
                content,
                outgoing,
            });
        }
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    /// Messages addressed to the local user by anyone, newest first.
    ///
    /// At most [`INBOX_LIMIT`] are requested. Each is decrypted against its
    /// own sender, falling back to [`DECRYPTION_PLACEHOLDER`].
    pub async fn fetch_inbox(&self) -> Result<Vec<DirectMessage>> {
        let me = self.public_key().await?;
        let filter = Filter::new()
            .kind(KIND_ENCRYPTED_DIRECT_MESSAGE)
            .pubkey_refs(vec![me.clone()])
            .limit(INBOX_LIMIT);
        let events = self.query(vec![filter]).await?;

        let mut messages = Vec::with_capacity(events.len());
        for event in events {
            if !is_direct_message(&event, &event.pubkey, &me) {
                debug!("Dropping off-filter event {} from inbox", event.id);
                continue;
            }
            let content = self.decrypt_or_placeholder(&event.pubkey, &event.content).await;
            messages.push(DirectMessage {
                id: event.id,
                outgoing: event.pubkey == me,
                sender: event.pubkey,
                recipient: me.clone(),
                created_at: event.created_at,
                content,
            });
        }
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(messages)
    }

    /// Live stream of events that mention the local user, starting after
    /// the last notification reset.
    pub async fn subscribe_notifications(&self) -> Result<SubscriptionHandle> {
        let me = self.public_key().await?;
        let mut filter = Filter::new().pubkey_refs(vec![me]);
        if let Some(since) = self.notifications.last_reset() {
            filter = filter.since(since);
        }
        self.subscribe(vec![filter]).await
    }

    // Publishing helpers

    /// Publish a kind 0 profile.
    pub async fn update_profile(&self, metadata: &Metadata) -> Result<Published> {
        let content = serde_json::to_string(metadata)?;
        let event = self.sign(content, KIND_METADATA, Vec::new()).await?;
        self.publish(&event).await
    }

    /// Encrypt and publish a kind 4 message to `recipient`.
    pub async fn send_direct_message(&self, recipient: &str, plaintext: &str) -> Result<Published> {
        let ciphertext = self.encrypt(recipient, plaintext).await?;
        let tags = vec![vec!["p".to_string(), recipient.to_string()]];
        let event = self
            .sign(ciphertext, KIND_ENCRYPTED_DIRECT_MESSAGE, tags)
            .await?;
        self.publish(&event).await
    }
}

/// A kind 4 event authored by `from` and tagged to `to`.
fn is_direct_message(event: &Event, from: &str, to: &str) -> bool {
    event.kind == KIND_ENCRYPTED_DIRECT_MESSAGE
        && event.pubkey == from
        && event.tag_values("p").any(|pk| pk == to)
}
