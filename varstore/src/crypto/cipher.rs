//! AES-CBC for variable payloads. Payloads are padded with a fixed filler to
//! the block size before encryption; no other padding scheme is applied, so
//! the ciphertext length is the padded plaintext length.

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use thiserror::Error;

pub const BLOCK_SIZE: usize = 16;

/// Filler appended to plaintext that is not block aligned.
pub const PAD_BYTE: u8 = 0x0F;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("invalid key length {0}; expected 16, 24 or 32 bytes")]
    InvalidKeyLength(usize),
    #[error("invalid iv length {0}; expected {BLOCK_SIZE} bytes")]
    InvalidIvLength(usize),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
}

/// Pads `data` with [`PAD_BYTE`] up to a whole number of blocks.
pub fn pad_to_block(data: &[u8]) -> Vec<u8> {
    let mut padded = data.to_vec();
    let rem = padded.len() % BLOCK_SIZE;
    if rem != 0 {
        padded.resize(padded.len() + BLOCK_SIZE - rem, PAD_BYTE);
    }
    padded
}

/// Encrypts `plaintext` in CBC mode. The cipher width follows the key length.
pub fn encrypt_cbc(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    if iv.len() != BLOCK_SIZE {
        return Err(CipherError::InvalidIvLength(iv.len()));
    }
    let mut buf = pad_to_block(plaintext);
    let len = buf.len();
    let failed = |e: &dyn std::fmt::Display| CipherError::EncryptionFailed(format!("{e}"));
    match key.len() {
        16 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|e| failed(&e))?
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map_err(|e| failed(&e))?,
        24 => cbc::Encryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(|e| failed(&e))?
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map_err(|e| failed(&e))?,
        32 => cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|e| failed(&e))?
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map_err(|e| failed(&e))?,
        other => return Err(CipherError::InvalidKeyLength(other)),
    };
    Ok(buf)
}

/// Decrypts CBC ciphertext. Filler padding is left in place.
pub fn decrypt_cbc(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
    if iv.len() != BLOCK_SIZE {
        return Err(CipherError::InvalidIvLength(iv.len()));
    }
    let mut buf = ciphertext.to_vec();
    let failed = |e: &dyn std::fmt::Display| CipherError::DecryptionFailed(format!("{e}"));
    match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|e| failed(&e))?
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|e| failed(&e))?,
        24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(|e| failed(&e))?
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|e| failed(&e))?,
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|e| failed(&e))?
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|e| failed(&e))?,
        other => return Err(CipherError::InvalidKeyLength(other)),
    };
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::{decrypt_cbc, encrypt_cbc, pad_to_block, CipherError, BLOCK_SIZE, PAD_BYTE};

    #[test]
    fn pads_only_when_unaligned() {
        assert_eq!(pad_to_block(&[1u8; 16]).len(), 16);
        let padded = pad_to_block(&[1u8; 5]);
        assert_eq!(padded.len(), BLOCK_SIZE);
        assert!(padded[5..].iter().all(|b| *b == PAD_BYTE));
        assert!(pad_to_block(&[]).is_empty());
    }

    #[test]
    fn matches_nist_cbc_vector() {
        // NIST SP 800-38A F.2.5, first block.
        let key = hex::decode("603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4").unwrap();
        let iv = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let plain = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        let cipher = encrypt_cbc(&key, &iv, &plain).expect("encryption should succeed");
        assert_eq!(hex::encode(cipher), "f58c4c04d6e5f1ba779eabfb5f7bfbd6");
    }

    #[test]
    fn encrypts_and_decrypts_round_trip() {
        let key = [42u8; 16];
        let iv = [7u8; 16];
        let cipher = encrypt_cbc(&key, &iv, b"variable-payload").expect("encryption should succeed");
        assert_ne!(cipher, b"variable-payload");
        let plain = decrypt_cbc(&key, &iv, &cipher).expect("decryption should succeed");
        assert_eq!(plain, b"variable-payload");
    }

    #[test]
    fn rejects_bad_keys_and_ivs() {
        let err = encrypt_cbc(&[1u8; 20], &[0u8; 16], b"x").unwrap_err();
        assert!(matches!(err, CipherError::InvalidKeyLength(20)));
        let err = encrypt_cbc(&[1u8; 32], &[0u8; 8], b"x").unwrap_err();
        assert!(format!("{err}").contains("invalid iv length"));
    }

    #[test]
    fn rejects_partial_blocks_on_decrypt() {
        let err = decrypt_cbc(&[1u8; 32], &[0u8; 16], &[0u8; 5]).unwrap_err();
        assert!(format!("{err}").contains("decryption failed"));
    }
}
