//! Client error types

use nostr::{KeyError, SignerError};
use thiserror::Error;

use crate::message::MessageError;
use crate::store::StoreError;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// No relay is connected, so the operation cannot proceed
    #[error("no connected relays")]
    NoConnectedRelays,

    /// Connection error (per relay; retried internally)
    #[error("connection error: {0}")]
    Connection(String),

    /// Relay is not connected
    #[error("not connected to relay")]
    NotConnected,

    /// Invalid relay URL
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Malformed relay frame
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] MessageError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Key material is missing or unusable
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// No key material has been configured
    #[error("no key material configured")]
    NoKeyMaterial,

    /// Key material is encrypted and must be unlocked first
    #[error("key material is locked")]
    KeyLocked,

    /// Signing failed
    #[error("signing failed: {0}")]
    SigningFailed(String),

    /// Encryption failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// A single relay rejected an event
    #[error("relay {relay} rejected event: {message}")]
    PublishRejected { relay: String, message: String },

    /// Every relay rejected or failed to acknowledge an event
    #[error("publish of {event_id} failed on every relay: {}", .failures.join("; "))]
    PublishFailed {
        event_id: String,
        failures: Vec<String>,
    },

    /// Timeout error
    #[error("timeout: {0}")]
    Timeout(String),

    /// Persisted state could not be read or written
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration could not be loaded or saved
    #[error("config error: {0}")]
    Config(String),
}

impl From<SignerError> for ClientError {
    fn from(err: SignerError) -> Self {
        match err {
            SignerError::InvalidKey(msg) => ClientError::InvalidKey(msg),
            SignerError::Signing(msg) | SignerError::Rejected(msg) => {
                ClientError::SigningFailed(msg)
            }
            SignerError::Encryption(msg) => ClientError::EncryptionFailed(msg),
            SignerError::DecryptionFailed(msg) => ClientError::DecryptionFailed(msg),
            SignerError::Locked => ClientError::KeyLocked,
        }
    }
}

impl From<KeyError> for ClientError {
    fn from(err: KeyError) -> Self {
        ClientError::InvalidKey(err.to_string())
    }
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
