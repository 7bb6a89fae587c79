//! Signing capability.
//!
//! [`NostrSigner`] is the seam between protocol code and whoever holds the
//! secret key. [`Keys`] implements it directly; browser extensions, hardware
//! devices, or remote signers implement it in the embedding application.

use async_trait::async_trait;
use thiserror::Error;

use crate::keys::Keys;
use crate::nip01::{Event, Nip01Error, UnsignedEvent, sign_event};
use crate::nip04::{self, Nip04Error};

/// Errors produced by a signer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignerError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("key material is locked")]
    Locked,

    #[error("signer rejected the request: {0}")]
    Rejected(String),
}

impl From<Nip01Error> for SignerError {
    fn from(err: Nip01Error) -> Self {
        match err {
            Nip01Error::InvalidKey(msg) => SignerError::InvalidKey(msg),
            other => SignerError::Signing(other.to_string()),
        }
    }
}

impl From<Nip04Error> for SignerError {
    fn from(err: Nip04Error) -> Self {
        match err {
            Nip04Error::InvalidKey(msg) => SignerError::InvalidKey(msg),
            Nip04Error::Encryption(msg) => SignerError::Encryption(msg),
            Nip04Error::DecryptionFailed(msg) => SignerError::DecryptionFailed(msg),
        }
    }
}

/// Something that can sign events and run NIP-04 for one identity.
#[async_trait]
pub trait NostrSigner: Send + Sync {
    /// Hex x-only public key.
    async fn public_key(&self) -> Result<String, SignerError>;

    /// Sign an unsigned event. Callers verify the result before publishing.
    async fn sign_event(&self, event: UnsignedEvent) -> Result<Event, SignerError>;

    async fn nip04_encrypt(&self, pubkey: &str, plaintext: &str) -> Result<String, SignerError>;

    async fn nip04_decrypt(&self, pubkey: &str, envelope: &str) -> Result<String, SignerError>;
}

#[async_trait]
impl NostrSigner for Keys {
    async fn public_key(&self) -> Result<String, SignerError> {
        Ok(self.public_key_hex())
    }

    async fn sign_event(&self, event: UnsignedEvent) -> Result<Event, SignerError> {
        Ok(sign_event(&event, self.secret_key())?)
    }

    async fn nip04_encrypt(&self, pubkey: &str, plaintext: &str) -> Result<String, SignerError> {
        Ok(nip04::encrypt(self.secret_key(), pubkey, plaintext)?)
    }

    async fn nip04_decrypt(&self, pubkey: &str, envelope: &str) -> Result<String, SignerError> {
        Ok(nip04::decrypt(self.secret_key(), pubkey, envelope)?)
    }
}
