//! NIP-01: Basic protocol flow description.
//!
//! This module implements the core Nostr event structure and operations:
//! - Event structure (id, pubkey, created_at, kind, tags, content, sig)
//! - Canonical serialization for hashing
//! - Event signing with BIP-340 Schnorr signatures
//! - Event verification (id recomputation + signature check)

use bitcoin::hashes::{Hash, sha256};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Keypair, Message, SecretKey, XOnlyPublicKey, schnorr};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors that can occur during NIP-01 operations.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// Strip id and signature, returning the signable fields.
    pub fn to_unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Values of every tag named `name` (second element of the tag).
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }
}

/// An unsigned event (before signing).
///
/// This is the shape handed to external signers: every field that
/// contributes to the id, nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

/// A template for creating events (without pubkey, which comes from the signing key).
///
/// ```
/// use nostr::EventTemplate;
///
/// let template = EventTemplate {
///     created_at: 1700000000,
///     kind: 1,
///     tags: vec![vec!["p".to_string(), "pubkey_to_mention".to_string()]],
///     content: "Hello Nostr!".to_string(),
/// };
/// assert_eq!(template.kind, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

// Standard event kinds
pub const KIND_METADATA: u16 = 0;
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;
pub const KIND_CONTACTS: u16 = 3;
pub const KIND_ENCRYPTED_DIRECT_MESSAGE: u16 = 4;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Generate a random 32-byte secret key.
pub fn generate_secret_key() -> [u8; 32] {
    loop {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        // Astronomically unlikely, but zero or >= n is not a valid scalar.
        if SecretKey::from_slice(&key).is_ok() {
            return key;
        }
    }
}

/// Parse raw secret key bytes, rejecting anything that is not a valid
/// 32-byte secp256k1 scalar.
pub fn parse_secret_key(secret_key: &[u8]) -> Result<SecretKey, Nip01Error> {
    if secret_key.len() != 32 {
        return Err(Nip01Error::InvalidKey(format!(
            "expected 32 bytes, got {}",
            secret_key.len()
        )));
    }
    SecretKey::from_slice(secret_key).map_err(|e| Nip01Error::InvalidKey(e.to_string()))
}

/// Get the public key (x-only, 32 bytes) from a secret key.
pub fn get_public_key(secret_key: &[u8]) -> Result<[u8; 32], Nip01Error> {
    let secp = Secp256k1::new();
    let sk = parse_secret_key(secret_key)?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    Ok(xonly.serialize())
}

/// Get the public key as a hex string from a secret key.
pub fn get_public_key_hex(secret_key: &[u8]) -> Result<String, Nip01Error> {
    Ok(hex::encode(get_public_key(secret_key)?))
}

/// Build an unsigned event stamped with the current time.
pub fn build_event(
    content: impl Into<String>,
    kind: u16,
    tags: Vec<Vec<String>>,
    pubkey: impl Into<String>,
) -> UnsignedEvent {
    UnsignedEvent {
        pubkey: pubkey.into(),
        created_at: unix_now(),
        kind,
        tags,
        content: content.into(),
    }
}

/// Serialize an unsigned event for hashing.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]`
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    if !validate_unsigned_event(event) {
        return Err(Nip01Error::InvalidEvent(
            "can't serialize event with wrong or missing properties".to_string(),
        ));
    }

    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| Nip01Error::Serialization(e.to_string()))
}

fn event_hash_bytes(event: &UnsignedEvent) -> Result<[u8; 32], Nip01Error> {
    let serialized = serialize_event(event)?;
    Ok(sha256::Hash::hash(serialized.as_bytes()).to_byte_array())
}

/// Get the event hash (id) from an unsigned event.
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    Ok(hex::encode(event_hash_bytes(event)?))
}

/// Validate an unsigned event structure.
pub fn validate_unsigned_event(event: &UnsignedEvent) -> bool {
    is_lower_hex(&event.pubkey, 64)
}

/// Validate a signed event structure (not including signature verification).
pub fn validate_event(event: &Event) -> bool {
    is_lower_hex(&event.id, 64) && is_lower_hex(&event.pubkey, 64) && is_lower_hex(&event.sig, 128)
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Sign an unsigned event with a raw secret key.
///
/// The pubkey is always re-derived from the key, so an unsigned event built
/// for a different author cannot end up with a mismatched signature.
pub fn sign_event(event: &UnsignedEvent, secret_key: &[u8]) -> Result<Event, Nip01Error> {
    let secp = Secp256k1::new();
    let sk = parse_secret_key(secret_key)?;
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let (xonly_pk, _parity) = keypair.x_only_public_key();

    let unsigned = UnsignedEvent {
        pubkey: hex::encode(xonly_pk.serialize()),
        ..event.clone()
    };

    let digest = event_hash_bytes(&unsigned)?;
    let message = Message::from_digest(digest);
    let sig = secp.sign_schnorr_no_aux_rand(&message, &keypair);

    Ok(Event {
        id: hex::encode(digest),
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig: hex::encode(sig.serialize()),
    })
}

/// Sign an event template with a secret key, producing a complete signed event.
pub fn finalize_event(template: &EventTemplate, secret_key: &[u8]) -> Result<Event, Nip01Error> {
    let pubkey = get_public_key_hex(secret_key)?;
    let unsigned = UnsignedEvent {
        pubkey,
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };
    sign_event(&unsigned, secret_key)
}

/// Verify an event's id and signature.
///
/// An event whose stored id differs from the recomputed hash is invalid
/// regardless of its signature.
pub fn verify_event(event: &Event) -> bool {
    if !validate_event(event) {
        return false;
    }

    let Ok(digest) = event_hash_bytes(&event.to_unsigned()) else {
        return false;
    };
    if hex::encode(digest) != event.id {
        return false;
    }

    let Ok(sig_bytes) = hex::decode(&event.sig) else {
        return false;
    };
    let Ok(sig) = schnorr::Signature::from_slice(&sig_bytes) else {
        return false;
    };
    let Ok(pubkey_bytes) = hex::decode(&event.pubkey) else {
        return false;
    };
    let Ok(pubkey) = XOnlyPublicKey::from_slice(&pubkey_bytes) else {
        return false;
    };

    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(&sig, &Message::from_digest(digest), &pubkey)
        .is_ok()
}

/// Sort events in reverse-chronological order by created_at,
/// then by id (lexicographically) in case of ties.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| match b.created_at.cmp(&a.created_at) {
        std::cmp::Ordering::Equal => a.id.cmp(&b.id),
        other => other,
    });
}
