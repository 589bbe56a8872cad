//! Passphrase-based encryption for the identity keystore
//!
//! Key derivation is PBKDF2-HMAC-SHA256 (100 000 rounds, random 16-byte salt);
//! the cipher is AES-256-GCM with a random 12-byte nonce.
//!
//! Layout written by [`encrypt`]:
//!
//! ```text
//! 0x01 ‖ salt(16) ‖ iv(12) ‖ ciphertext+tag
//! ```
//!
//! Stores created before the version byte existed are `salt ‖ iv ‖ ciphertext+tag`.
//! [`decrypt`] still reads them; that path exists only for migration.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const PBKDF2_ROUNDS: u32 = 100_000;

/// Version byte of the tagged layout
pub const FORMAT_V1: u8 = 0x01;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encrypted data is too short ({0} bytes)")]
    TooShort(usize),

    #[error("decryption failed: wrong passphrase or corrupted data")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,
}

pub fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Encrypt `plaintext` into the tagged layout
pub fn encrypt(passphrase: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    let mut rng = rand::rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut iv);

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::EncryptionFailed)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(1 + SALT_LEN + IV_LEN + ciphertext.len());
    out.push(FORMAT_V1);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a tagged or legacy untagged blob
pub fn decrypt(passphrase: &str, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.first() == Some(&FORMAT_V1) && blob.len() > 1 + SALT_LEN + IV_LEN + TAG_LEN {
        if let Ok(plaintext) = decrypt_untagged(passphrase, &blob[1..]) {
            return Ok(plaintext);
        }
        // A legacy salt may start with the version byte by chance
    }
    decrypt_untagged(passphrase, blob)
}

/// `salt ‖ iv ‖ ciphertext+tag`
fn decrypt_untagged(passphrase: &str, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if bytes.len() < SALT_LEN + IV_LEN + TAG_LEN {
        return Err(CryptoError::TooShort(bytes.len()));
    }
    let (salt, rest) = bytes.split_at(SALT_LEN);
    let (iv, ciphertext) = rest.split_at(IV_LEN);

    let key = derive_key(passphrase, salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::DecryptionFailed)?;
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Structural probe for legacy plaintext JSON stores
pub fn looks_like_plaintext_json(bytes: &[u8]) -> bool {
    let trimmed = bytes.trim_ascii();
    trimmed.first() == Some(&b'{') && trimmed.last() == Some(&b'}')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let blob = encrypt("correct horse", b"{\"hello\":1}").unwrap();
        assert_eq!(blob[0], FORMAT_V1);
        assert_eq!(blob.len(), 1 + SALT_LEN + IV_LEN + 11 + TAG_LEN);
        assert_eq!(decrypt("correct horse", &blob).unwrap(), b"{\"hello\":1}");
    }

    #[test]
    fn test_wrong_passphrase_is_distinguishable() {
        let blob = encrypt("right", b"secret").unwrap();
        assert_eq!(decrypt("wrong", &blob), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_tampered_ciphertext_is_rejected() {
        let mut blob = encrypt("right", b"secret").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert_eq!(decrypt("right", &blob), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_reads_legacy_untagged_layout() {
        let tagged = encrypt("pass", b"legacy").unwrap();
        let legacy = &tagged[1..];
        assert_eq!(decrypt("pass", legacy).unwrap(), b"legacy");
    }

    #[test]
    fn test_short_input() {
        assert_eq!(decrypt("pass", &[1, 2, 3]), Err(CryptoError::TooShort(3)));
    }

    #[test]
    fn test_plaintext_probe() {
        assert!(looks_like_plaintext_json(b"{\"publicKey\":\"ab\"}"));
        assert!(looks_like_plaintext_json(b"  {}\n"));
        assert!(!looks_like_plaintext_json(&[FORMAT_V1, b'{', b'}']));
        assert!(!looks_like_plaintext_json(b""));
    }
}
