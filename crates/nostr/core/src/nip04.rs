//! NIP-04: Encrypted Direct Message.
//!
//! Envelope layout (the only one supported):
//!
//! ```text
//! base64(ciphertext) "?iv=" base64(iv)
//! ```
//!
//! - shared secret: x-coordinate of ECDH(secret key, recipient x-only key
//!   lifted with even parity)
//! - cipher: AES-256-CBC with PKCS#7 padding, keyed by the 32-byte shared secret
//! - iv: 16 fresh random bytes per message
//!
//! CBC carries no authentication tag. A wrong key surfaces as a padding or
//! UTF-8 failure; it never reproduces the sender's plaintext.

use aes::Aes256;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bitcoin::secp256k1::{PublicKey, ecdh};
use rand::RngCore;
use thiserror::Error;

use crate::nip01::parse_secret_key;

/// Kind used for NIP-04 direct messages.
pub const ENCRYPTED_DM_KIND: u16 = crate::nip01::KIND_ENCRYPTED_DIRECT_MESSAGE;

/// Separator between ciphertext and iv in the envelope.
pub const IV_SEPARATOR: &str = "?iv=";

/// Size of the AES-CBC initialization vector.
pub const IV_SIZE: usize = 16;

/// Shown in place of a message that could not be decrypted.
pub const DECRYPTION_PLACEHOLDER: &str = "[Unable to decrypt message]";

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Errors that can occur during NIP-04 operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Nip04Error {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
}

/// Derive the 32-byte NIP-04 shared secret.
pub fn shared_secret(secret_key: &[u8], public_key_hex: &str) -> Result<[u8; 32], Nip04Error> {
    let sk = parse_secret_key(secret_key).map_err(|e| Nip04Error::InvalidKey(e.to_string()))?;
    let pk = lift_x_only(public_key_hex)?;

    let point = ecdh::shared_secret_point(&pk, &sk);
    let mut x = [0u8; 32];
    x.copy_from_slice(&point[..32]);
    Ok(x)
}

fn lift_x_only(public_key_hex: &str) -> Result<PublicKey, Nip04Error> {
    let bytes =
        hex::decode(public_key_hex).map_err(|e| Nip04Error::InvalidKey(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(Nip04Error::InvalidKey(format!(
            "expected 32-byte x-only public key, got {} bytes",
            bytes.len()
        )));
    }
    let mut compressed = [0u8; 33];
    compressed[0] = 0x02;
    compressed[1..].copy_from_slice(&bytes);
    PublicKey::from_slice(&compressed).map_err(|e| Nip04Error::InvalidKey(e.to_string()))
}

/// Encrypt `plaintext` from the holder of `secret_key` to `recipient_pubkey`.
pub fn encrypt(
    secret_key: &[u8],
    recipient_pubkey: &str,
    plaintext: &str,
) -> Result<String, Nip04Error> {
    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv);
    encrypt_with_iv(secret_key, recipient_pubkey, plaintext, iv)
}

fn encrypt_with_iv(
    secret_key: &[u8],
    recipient_pubkey: &str,
    plaintext: &str,
    iv: [u8; IV_SIZE],
) -> Result<String, Nip04Error> {
    let key = shared_secret(secret_key, recipient_pubkey)?;
    let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|e| Nip04Error::Encryption(e.to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    Ok(format!(
        "{}{}{}",
        STANDARD.encode(ciphertext),
        IV_SEPARATOR,
        STANDARD.encode(iv)
    ))
}

/// Decrypt an envelope sent by `sender_pubkey` to the holder of `secret_key`.
///
/// Every failure, including malformed envelopes and bad keys, is reported
/// as [`Nip04Error::DecryptionFailed`].
pub fn decrypt(secret_key: &[u8], sender_pubkey: &str, envelope: &str) -> Result<String, Nip04Error> {
    let (ciphertext_b64, iv_b64) = envelope
        .split_once(IV_SEPARATOR)
        .ok_or_else(|| Nip04Error::DecryptionFailed("missing iv separator".to_string()))?;

    let ciphertext = STANDARD
        .decode(ciphertext_b64)
        .map_err(|e| Nip04Error::DecryptionFailed(format!("ciphertext: {}", e)))?;
    let iv = STANDARD
        .decode(iv_b64)
        .map_err(|e| Nip04Error::DecryptionFailed(format!("iv: {}", e)))?;
    if iv.len() != IV_SIZE {
        return Err(Nip04Error::DecryptionFailed(format!(
            "iv must be {} bytes, got {}",
            IV_SIZE,
            iv.len()
        )));
    }

    let key = shared_secret(secret_key, sender_pubkey)
        .map_err(|e| Nip04Error::DecryptionFailed(e.to_string()))?;
    let cipher = Aes256CbcDec::new_from_slices(&key, &iv)
        .map_err(|e| Nip04Error::DecryptionFailed(e.to_string()))?;
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| Nip04Error::DecryptionFailed("bad padding".to_string()))?;

    String::from_utf8(plaintext)
        .map_err(|_| Nip04Error::DecryptionFailed("plaintext is not utf-8".to_string()))
}

/// Decrypt, substituting [`DECRYPTION_PLACEHOLDER`] on failure.
pub fn decrypt_or_placeholder(secret_key: &[u8], sender_pubkey: &str, envelope: &str) -> String {
    decrypt(secret_key, sender_pubkey, envelope)
        .unwrap_or_else(|_| DECRYPTION_PLACEHOLDER.to_string())
}
