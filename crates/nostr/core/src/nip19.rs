//! NIP-19: bech32-encoded keys.
//!
//! Only the bare key forms are supported: `npub` for x-only public keys and
//! `nsec` for secret keys. Both carry exactly 32 bytes of payload.

use bech32::{Bech32, Hrp};
use thiserror::Error;

/// Human-readable part for nsec (private key)
pub const NSEC_HRP: &str = "nsec";

/// Human-readable part for npub (public key)
pub const NPUB_HRP: &str = "npub";

/// Errors that can occur during NIP-19 operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Nip19Error {
    #[error("bech32 encoding error: {0}")]
    Encode(String),

    #[error("bech32 decoding error: {0}")]
    Decode(String),

    #[error("invalid hrp: expected {expected}, got {got}")]
    InvalidHrp { expected: String, got: String },

    #[error("invalid payload length: expected 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

/// Encode a 32-byte public key as npub.
pub fn encode_npub(public_key: &[u8; 32]) -> Result<String, Nip19Error> {
    encode_bech32(NPUB_HRP, public_key)
}

/// Encode a hex public key as npub.
pub fn encode_npub_hex(public_key_hex: &str) -> Result<String, Nip19Error> {
    encode_npub(&hex_to_32(public_key_hex)?)
}

/// Decode an npub to its 32-byte public key.
pub fn decode_npub(npub: &str) -> Result<[u8; 32], Nip19Error> {
    decode_bech32(NPUB_HRP, npub)
}

/// Decode an npub to a lowercase hex public key.
pub fn decode_npub_hex(npub: &str) -> Result<String, Nip19Error> {
    decode_npub(npub).map(hex::encode)
}

/// Encode a 32-byte secret key as nsec.
pub fn encode_nsec(secret_key: &[u8; 32]) -> Result<String, Nip19Error> {
    encode_bech32(NSEC_HRP, secret_key)
}

/// Decode an nsec to its 32-byte secret key.
pub fn decode_nsec(nsec: &str) -> Result<[u8; 32], Nip19Error> {
    decode_bech32(NSEC_HRP, nsec)
}

fn hex_to_32(value: &str) -> Result<[u8; 32], Nip19Error> {
    let bytes = hex::decode(value).map_err(|e| Nip19Error::InvalidHex(e.to_string()))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| Nip19Error::InvalidLength(bytes.len()))
}

fn encode_bech32(hrp: &str, data: &[u8; 32]) -> Result<String, Nip19Error> {
    let hrp = Hrp::parse(hrp).map_err(|e| Nip19Error::Encode(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, data).map_err(|e| Nip19Error::Encode(e.to_string()))
}

fn decode_bech32(expected_hrp: &str, encoded: &str) -> Result<[u8; 32], Nip19Error> {
    let expected = Hrp::parse(expected_hrp).map_err(|e| Nip19Error::Decode(e.to_string()))?;

    let (hrp, data) = bech32::decode(encoded).map_err(|e| Nip19Error::Decode(e.to_string()))?;
    if hrp != expected {
        return Err(Nip19Error::InvalidHrp {
            expected: expected_hrp.to_string(),
            got: hrp.to_string(),
        });
    }

    <[u8; 32]>::try_from(data.as_slice()).map_err(|_| Nip19Error::InvalidLength(data.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const NPUB: &str = "npub10elfcs4fr0l0r8af98jlmgdh9c8tcxjvz9qkw038js35mp4dma8qzvjptg";
    const NPUB_HEX: &str = "7e7e9c42a91bfef19fa929e5fda1b72e0ebc1a4c1141673e2794234d86addf4e";
    const NSEC: &str = "nsec1vl029mgpspedva04g90vltkh6fvh240zqtv9k0t9af8935ke9laqsnlfe5";
    const NSEC_HEX: &str = "67dea2ed018072d675f5415ecfaed7d2597555e202d85b3d65ea4e58d2d92ffa";

    #[test]
    fn test_npub_vector() {
        assert_eq!(encode_npub_hex(NPUB_HEX).unwrap(), NPUB);
        assert_eq!(decode_npub_hex(NPUB).unwrap(), NPUB_HEX);
    }

    #[test]
    fn test_nsec_vector() {
        let sk: [u8; 32] = hex::decode(NSEC_HEX).unwrap().try_into().unwrap();
        assert_eq!(encode_nsec(&sk).unwrap(), NSEC);
        assert_eq!(decode_nsec(NSEC).unwrap(), sk);
    }

    #[test]
    fn test_wrong_hrp_rejected() {
        assert!(matches!(
            decode_npub(NSEC),
            Err(Nip19Error::InvalidHrp { .. })
        ));
        assert!(matches!(
            decode_nsec(NPUB),
            Err(Nip19Error::InvalidHrp { .. })
        ));
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let mut corrupted = NPUB.to_string();
        let last = corrupted.pop().unwrap();
        corrupted.push(if last == 'q' { 'p' } else { 'q' });
        assert!(matches!(decode_npub(&corrupted), Err(Nip19Error::Decode(_))));
    }

    #[test]
    fn test_bad_hex_input() {
        assert!(matches!(
            encode_npub_hex("not hex"),
            Err(Nip19Error::InvalidHex(_))
        ));
        assert!(matches!(
            encode_npub_hex("abcd"),
            Err(Nip19Error::InvalidLength(2))
        ));
    }

    proptest! {
        #[test]
        fn prop_npub_roundtrip(bytes in any::<[u8; 32]>()) {
            let encoded = encode_npub(&bytes).unwrap();
            prop_assert!(encoded.starts_with("npub1"));
            prop_assert_eq!(decode_npub(&encoded).unwrap(), bytes);
        }
    }
}
