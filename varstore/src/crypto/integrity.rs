//! Key derivation and keyed digests for the variable store.
//!
//! Every store key is HKDF-SHA256 over the root key with an empty salt,
//! expanded to the root key's own length so AES-128/192/256 roots yield keys
//! of the same strength. The authentication transcript is sealed with
//! HMAC-SHA256.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("cannot derive a {length}-byte store key: {reason}")]
    KeyDerivation { length: usize, reason: String },
    #[error("transcript key rejected: {0}")]
    TranscriptKey(String),
}

/// Hex SHA-256 of an output image, for logs.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Derives a key as long as `root_key`, bound to `context`.
pub fn derive_key(root_key: &[u8], context: &[u8]) -> Result<Zeroizing<Vec<u8>>, IntegrityError> {
    // A `None` salt is HashLen zero bytes, which HMAC treats the same as an
    // empty salt.
    let hk = Hkdf::<Sha256>::new(None, root_key);
    let mut key = Zeroizing::new(vec![0u8; root_key.len()]);
    hk.expand(context, key.as_mut_slice())
        .map_err(|e| IntegrityError::KeyDerivation {
            length: root_key.len(),
            reason: e.to_string(),
        })?;
    Ok(key)
}

/// HMAC-SHA256 over a store transcript.
pub fn sign_transcript(key: &[u8], transcript: &[u8]) -> Result<Vec<u8>, IntegrityError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| IntegrityError::TranscriptKey(e.to_string()))?;
    mac.update(transcript);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::{derive_key, sha256_hex, sign_transcript, IntegrityError};
    use hkdf::Hkdf;
    use sha2::Sha256;

    #[test]
    fn hashes_to_hex() {
        assert_eq!(sha256_hex(b"abc"), "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }

    #[test]
    fn signs_with_hmac_sha256() {
        // RFC 4231 test case 2.
        let tag = sign_transcript(b"Jefe", b"what do ya want for nothing?").expect("hmac should succeed");
        assert_eq!(hex::encode(tag), "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843");
    }

    #[test]
    fn derived_key_matches_empty_salt_hkdf() {
        let root = [0x42u8; 24];
        let key = derive_key(&root, b"ctx").expect("hkdf should work");
        assert_eq!(key.len(), 24);

        let mut expected = [0u8; 24];
        Hkdf::<Sha256>::new(Some(&[][..]), &root)
            .expand(b"ctx", &mut expected)
            .unwrap();
        assert_eq!(key.as_slice(), &expected[..]);
    }

    #[test]
    fn contexts_separate_keys() {
        let root = [7u8; 32];
        let a = derive_key(&root, b"A").unwrap();
        let b = derive_key(&root, b"B").unwrap();
        assert_ne!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn rejects_oversized_root_key() {
        let root = vec![1u8; 255 * 32 + 1];
        let err = derive_key(&root, b"ctx").unwrap_err();
        assert!(matches!(err, IntegrityError::KeyDerivation { length, .. } if length == root.len()));
    }
}
