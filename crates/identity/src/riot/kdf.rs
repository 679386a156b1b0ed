//! RIoT key derivation.
//!
//! Keys come from an SP800-108 counter-mode KDF with HMAC-SHA256 as the PRF.
//! A candidate that is not a valid P-256 scalar is discarded and the
//! counter advanced.

use hmac::{Hmac, Mac};
use p256::SecretKey;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{HsmError, HsmResult};

type HmacSha256 = Hmac<Sha256>;

/// Label for the DeviceID key derivation
pub const LABEL_IDENTITY: &[u8] = b"identity";
/// Label for the Alias key derivation
pub const LABEL_ALIAS: &[u8] = b"alias";

/// Output length in bits, encoded as the trailing `L` field.
const OUTPUT_BITS: u32 = 256;

/// Candidates tried before giving up. An invalid scalar has probability
/// near 2^-32, so this is never reached in practice.
const MAX_ATTEMPTS: u32 = 16;

/// SHA-256 of the concatenation of `parts`.
pub fn hash(parts: &[&[u8]]) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    Zeroizing::new(hasher.finalize().into())
}

/// One SP800-108 counter-mode block: `HMAC(key, i || label || 0x00 || L)`.
pub fn sp800_108(key: &[u8], counter: u32, label: &[u8]) -> HsmResult<Zeroizing<[u8; 32]>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| HsmError::Signing(format!("KDF key rejected: {}", e)))?;
    mac.update(&counter.to_be_bytes());
    mac.update(label);
    mac.update(&[0x00]);
    mac.update(&OUTPUT_BITS.to_be_bytes());
    Ok(Zeroizing::new(mac.finalize().into_bytes().into()))
}

/// Derive a P-256 key pair from `source` under `label`.
pub fn derive_ecc_key(source: &[u8], label: &[u8]) -> HsmResult<SecretKey> {
    if source.is_empty() || label.is_empty() {
        return Err(HsmError::InvalidArgument(
            "key derivation needs a source and a label".into(),
        ));
    }
    for counter in 1..=MAX_ATTEMPTS {
        let candidate = sp800_108(source, counter, label)?;
        if let Ok(key) = SecretKey::from_slice(candidate.as_slice()) {
            return Ok(key);
        }
    }
    Err(HsmError::Signing(
        "no valid P-256 scalar produced by key derivation".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_ecc_key(&[7u8; 32], LABEL_IDENTITY).unwrap();
        let b = derive_ecc_key(&[7u8; 32], LABEL_IDENTITY).unwrap();
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn test_labels_separate_keys() {
        let identity = derive_ecc_key(&[7u8; 32], LABEL_IDENTITY).unwrap();
        let alias = derive_ecc_key(&[7u8; 32], LABEL_ALIAS).unwrap();
        assert_ne!(identity.to_bytes(), alias.to_bytes());
    }

    #[test]
    fn test_counter_changes_block() {
        let first = sp800_108(b"key", 1, LABEL_ALIAS).unwrap();
        let second = sp800_108(b"key", 2, LABEL_ALIAS).unwrap();
        assert_ne!(*first, *second);
    }

    #[test]
    fn test_empty_inputs_rejected() {
        assert!(matches!(
            derive_ecc_key(&[], LABEL_ALIAS),
            Err(HsmError::InvalidArgument(_))
        ));
        assert!(matches!(
            derive_ecc_key(&[1; 32], b""),
            Err(HsmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_hash_concatenates() {
        let joined = hash(&[b"ab", b"cd"]);
        let whole = hash(&[b"abcd"]);
        assert_eq!(*joined, *whole);
    }
}
