//! Key handling.
//!
//! [`Keys`] is a locally held keypair. [`KeyMaterial`] is what a session
//! signs with: local keys, an external signer capability, or an encrypted
//! blob that must be unlocked through a [`KeyVault`] first.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::nip01::{generate_secret_key, get_public_key, parse_secret_key};
use crate::nip19::{decode_nsec, encode_npub, encode_nsec};
use crate::signer::{NostrSigner, SignerError};

/// Errors that can occur while loading or unlocking keys.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("key vault error: {0}")]
    Vault(String),

    #[error("unlocked key does not match public key {expected}")]
    PublicKeyMismatch { expected: String },
}

/// A locally held secp256k1 keypair.
#[derive(Clone, PartialEq, Eq)]
pub struct Keys {
    secret_key: [u8; 32],
    public_key: [u8; 32],
}

impl Keys {
    /// Build from raw secret key bytes.
    pub fn from_secret_bytes(secret_key: &[u8]) -> Result<Self, KeyError> {
        parse_secret_key(secret_key).map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        let public_key =
            get_public_key(secret_key).map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        let mut sk = [0u8; 32];
        sk.copy_from_slice(secret_key);
        Ok(Self {
            secret_key: sk,
            public_key,
        })
    }

    pub fn from_hex(secret_key_hex: &str) -> Result<Self, KeyError> {
        let bytes =
            hex::decode(secret_key_hex).map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn from_nsec(nsec: &str) -> Result<Self, KeyError> {
        let bytes = decode_nsec(nsec).map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        Self::from_secret_bytes(&bytes)
    }

    /// Accept either an `nsec1...` string or 64 hex characters.
    pub fn parse(value: &str) -> Result<Self, KeyError> {
        let value = value.trim();
        if value.starts_with("nsec1") {
            Self::from_nsec(value)
        } else {
            Self::from_hex(value)
        }
    }

    pub fn generate() -> Self {
        let secret_key = generate_secret_key();
        // A freshly generated scalar is always valid.
        let public_key = get_public_key(&secret_key).unwrap_or_default();
        Self {
            secret_key,
            public_key,
        }
    }

    pub fn secret_key(&self) -> &[u8; 32] {
        &self.secret_key
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }

    pub fn npub(&self) -> Result<String, KeyError> {
        encode_npub(&self.public_key).map_err(|e| KeyError::InvalidKey(e.to_string()))
    }

    pub fn nsec(&self) -> Result<String, KeyError> {
        encode_nsec(&self.secret_key).map_err(|e| KeyError::InvalidKey(e.to_string()))
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("secret_key", &"[redacted]")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Password-based protection of a secret key at rest.
///
/// Implemented by the embedding application. Decrypting with the wrong
/// password must fail, never return a different key.
pub trait KeyVault: Send + Sync {
    fn encrypt(&self, secret_key: &[u8; 32], password: &str) -> Result<String, KeyError>;
    fn decrypt(&self, blob: &str, password: &str) -> Result<[u8; 32], KeyError>;
}

/// The key source for a session.
#[derive(Clone)]
pub enum KeyMaterial {
    /// Raw secret key held in memory.
    Local(Keys),
    /// External signer; the raw key is never visible.
    External(Arc<dyn NostrSigner>),
    /// Encrypted at rest; call [`KeyMaterial::unlock`] before signing.
    Encrypted { blob: String, public_key: String },
}

impl KeyMaterial {
    /// Protect local keys with `vault`, producing the at-rest form.
    pub fn seal(keys: &Keys, vault: &dyn KeyVault, password: &str) -> Result<Self, KeyError> {
        let blob = vault.encrypt(keys.secret_key(), password)?;
        Ok(KeyMaterial::Encrypted {
            blob,
            public_key: keys.public_key_hex(),
        })
    }

    /// Turn `Encrypted` into `Local`. Other variants are returned unchanged.
    pub fn unlock(&self, vault: &dyn KeyVault, password: &str) -> Result<Self, KeyError> {
        match self {
            KeyMaterial::Encrypted { blob, public_key } => {
                let secret = vault.decrypt(blob, password)?;
                let keys = Keys::from_secret_bytes(&secret)?;
                if !keys.public_key_hex().eq_ignore_ascii_case(public_key) {
                    return Err(KeyError::PublicKeyMismatch {
                        expected: public_key.clone(),
                    });
                }
                Ok(KeyMaterial::Local(keys))
            }
            other => Ok(other.clone()),
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, KeyMaterial::Encrypted { .. })
    }

    /// Public key of this material. External signers are asked.
    pub async fn public_key(&self) -> Result<String, SignerError> {
        match self {
            KeyMaterial::Local(keys) => Ok(keys.public_key_hex()),
            KeyMaterial::External(signer) => signer.public_key().await,
            KeyMaterial::Encrypted { public_key, .. } => Ok(public_key.clone()),
        }
    }

    /// Signing capability for this material.
    pub fn signer(&self) -> Result<Arc<dyn NostrSigner>, SignerError> {
        match self {
            KeyMaterial::Local(keys) => Ok(Arc::new(keys.clone())),
            KeyMaterial::External(signer) => Ok(Arc::clone(signer)),
            KeyMaterial::Encrypted { .. } => Err(SignerError::Locked),
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMaterial::Local(keys) => f.debug_tuple("Local").field(keys).finish(),
            KeyMaterial::External(_) => f.write_str("External(..)"),
            KeyMaterial::Encrypted { public_key, .. } => f
                .debug_struct("Encrypted")
                .field("public_key", public_key)
                .finish_non_exhaustive(),
        }
    }
}
