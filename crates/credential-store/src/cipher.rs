//! Authenticated encryption of secrets at rest
//!
//! AES-256-GCM with a key derived per write: PBKDF2-HMAC-SHA256 over the
//! master key and a fresh random 16-byte salt. The salt is also bound as
//! associated data, so swapping salts between envelopes fails to open.
//!
//! Envelope: `base64(salt ‖ nonce ‖ ciphertext ‖ tag)`.

use std::num::NonZeroU32;

use aws_lc_rs::aead::{AES_256_GCM, Aad, NONCE_LEN, Nonce, RandomizedNonceKey};
use aws_lc_rs::pbkdf2;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::Secret;
use rand::RngExt;
use zeroize::Zeroize;

/// Shortest master key accepted.
pub const MIN_MASTER_KEY_LEN: usize = 32;

const SALT_LEN: usize = 16;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PBKDF2_ITERATIONS: u32 = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("invalid master key: {0}")]
    InvalidKey(String),

    #[error("encryption failed")]
    Encrypt,

    /// Wrong key or tampered envelope. Never yields partial plaintext.
    #[error("decryption failed")]
    Decrypt,

    #[error("malformed envelope: {0}")]
    Format(String),
}

/// Encrypts and decrypts credential secrets with the master key.
pub struct SecretCipher {
    master: Secret<String>,
}

impl SecretCipher {
    pub fn new(master_key: Secret<String>) -> Result<Self, CipherError> {
        if master_key.expose().chars().count() < MIN_MASTER_KEY_LEN {
            return Err(CipherError::InvalidKey(format!(
                "master key must be at least {MIN_MASTER_KEY_LEN} characters"
            )));
        }
        Ok(Self { master: master_key })
    }

    fn derive_key(&self, salt: &[u8]) -> Result<RandomizedNonceKey, CipherError> {
        let iterations = NonZeroU32::new(PBKDF2_ITERATIONS)
            .ok_or_else(|| CipherError::InvalidKey("zero PBKDF2 iterations".into()))?;
        let mut key = [0u8; KEY_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt,
            self.master.expose().as_bytes(),
            &mut key,
        );
        let sealed = RandomizedNonceKey::new(&AES_256_GCM, &key)
            .map_err(|_| CipherError::InvalidKey("derived key rejected".into()));
        key.zeroize();
        sealed
    }

    /// Encrypt and base64 encode.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut salt = [0u8; SALT_LEN];
        rand::rng().fill(&mut salt);
        let key = self.derive_key(&salt)?;

        let mut in_out = plaintext.as_bytes().to_vec();
        let nonce = key
            .seal_in_place_append_tag(Aad::from(&salt[..]), &mut in_out)
            .map_err(|_| CipherError::Encrypt)?;

        let mut envelope = Vec::with_capacity(SALT_LEN + NONCE_LEN + in_out.len());
        envelope.extend_from_slice(&salt);
        envelope.extend_from_slice(nonce.as_ref());
        envelope.extend_from_slice(&in_out);
        in_out.zeroize();
        Ok(STANDARD.encode(&envelope))
    }

    /// Decode and decrypt.
    pub fn decrypt(&self, envelope: &str) -> Result<Secret<String>, CipherError> {
        let data = STANDARD
            .decode(envelope)
            .map_err(|e| CipherError::Format(format!("not base64: {e}")))?;
        if data.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
            return Err(CipherError::Format(format!(
                "envelope too short ({} bytes)",
                data.len()
            )));
        }

        let (salt, rest) = data.split_at(SALT_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CipherError::Format("bad nonce".into()))?;
        let key = self.derive_key(salt)?;

        let mut in_out = ciphertext.to_vec();
        let opened = key
            .open_in_place(nonce, Aad::from(salt), &mut in_out)
            .map_err(|_| CipherError::Decrypt)?;
        let plaintext = String::from_utf8(opened.to_vec()).map_err(|_| CipherError::Decrypt);
        in_out.zeroize();
        plaintext.map(Secret::new)
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    fn cipher(key: &str) -> SecretCipher {
        SecretCipher::new(Secret::from(key)).unwrap()
    }

    #[test]
    fn roundtrip() {
        let c = cipher(KEY);
        let envelope = c.encrypt("sk-ant-api03-secret").unwrap();
        assert!(!envelope.contains("sk-ant"));
        assert_eq!(c.decrypt(&envelope).unwrap().expose(), "sk-ant-api03-secret");
    }

    #[test]
    fn same_plaintext_encrypts_differently() {
        let c = cipher(KEY);
        assert_ne!(c.encrypt("token").unwrap(), c.encrypt("token").unwrap());
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let envelope = cipher(KEY).encrypt("token").unwrap();
        let other = cipher("ffffffffffffffffffffffffffffffff");
        assert_eq!(other.decrypt(&envelope).unwrap_err(), CipherError::Decrypt);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let c = cipher(KEY);
        let envelope = c.encrypt("token").unwrap();
        let mut raw = STANDARD.decode(&envelope).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert_eq!(c.decrypt(&STANDARD.encode(&raw)).unwrap_err(), CipherError::Decrypt);
    }

    #[test]
    fn tampered_salt_fails() {
        let c = cipher(KEY);
        let envelope = c.encrypt("token").unwrap();
        let mut raw = STANDARD.decode(&envelope).unwrap();
        raw[0] ^= 0x80;
        assert_eq!(c.decrypt(&STANDARD.encode(&raw)).unwrap_err(), CipherError::Decrypt);
    }

    #[test]
    fn short_or_garbage_envelope_is_format_error() {
        let c = cipher(KEY);
        assert!(matches!(c.decrypt("not base64 !!"), Err(CipherError::Format(_))));
        assert!(matches!(c.decrypt(&STANDARD.encode([0u8; 10])), Err(CipherError::Format(_))));
    }

    #[test]
    fn short_master_key_rejected() {
        let err = SecretCipher::new(Secret::from("too-short")).unwrap_err();
        assert!(matches!(err, CipherError::InvalidKey(_)));
    }
}
