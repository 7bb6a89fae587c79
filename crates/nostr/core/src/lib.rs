//! Nostr protocol primitives.
//!
//! This crate provides:
//! - NIP-01: events, canonical hashing, Schnorr signing and verification
//! - NIP-04: encrypted direct messages (AES-256-CBC envelope)
//! - NIP-19: `npub` / `nsec` key encodings
//! - Key material and the [`NostrSigner`] capability used to sign with
//!   local keys or an external signer
//!
//! Nothing here performs I/O; relay connectivity lives in `nostr-client`.
//!
//! # Example
//!
//! ```
//! use nostr::{EventTemplate, KIND_SHORT_TEXT_NOTE, finalize_event, generate_secret_key, verify_event};
//!
//! let secret_key = generate_secret_key();
//! let template = EventTemplate {
//!     created_at: 1700000000,
//!     kind: KIND_SHORT_TEXT_NOTE,
//!     tags: vec![],
//!     content: "hello".to_string(),
//! };
//! let event = finalize_event(&template, &secret_key).unwrap();
//! assert!(verify_event(&event));
//! ```

mod keys;
mod nip01;
mod nip04;
mod nip19;
mod signer;

// NIP-01: Basic protocol
pub use nip01::{
    Event, EventTemplate, KIND_CONTACTS, KIND_ENCRYPTED_DIRECT_MESSAGE, KIND_METADATA,
    KIND_SHORT_TEXT_NOTE, Nip01Error, UnsignedEvent, build_event, finalize_event,
    generate_secret_key, get_event_hash, get_public_key, get_public_key_hex, parse_secret_key,
    serialize_event, sign_event, sort_events, unix_now, validate_event, validate_unsigned_event,
    verify_event,
};

// NIP-04: Encrypted Direct Messages
pub use nip04::{
    DECRYPTION_PLACEHOLDER, ENCRYPTED_DM_KIND, IV_SEPARATOR, Nip04Error, decrypt,
    decrypt_or_placeholder, encrypt, shared_secret,
};

// NIP-19: bech32-encoded keys
pub use nip19::{
    NPUB_HRP, NSEC_HRP, Nip19Error, decode_npub, decode_npub_hex, decode_nsec, encode_npub,
    encode_npub_hex, encode_nsec,
};

// Keys and signing capability
pub use keys::{KeyError, KeyMaterial, KeyVault, Keys};
pub use signer::{NostrSigner, SignerError};
