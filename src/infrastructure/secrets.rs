//! Credential encryption at rest.
//!
//! API keys never touch the database in plaintext: the registry encrypts
//! them with AES-256-GCM before every write and decrypts on load. The key
//! is derived from the operator-provided secret, so a copied database file
//! alone does not leak exchange credentials.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct CredentialCipher {
    key: Key<Aes256Gcm>,
}

impl CredentialCipher {
    /// Derive the AES-256 key from an operator secret of any length.
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        Self {
            key: Key::<Aes256Gcm>::clone_from_slice(&digest),
        }
    }

    /// Encrypt to hex("nonce || ciphertext"); a fresh nonce per call.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("Credential encryption failed: {}", e))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        let raw = hex::decode(encrypted).context("Encrypted credential is not valid hex")?;
        if raw.len() <= NONCE_LEN {
            anyhow::bail!("Encrypted credential too short");
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new(&self.key);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow::anyhow!("Credential decryption failed (wrong key or corrupt data)"))?;
        String::from_utf8(plaintext).context("Decrypted credential is not UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_and_never_stores_plaintext() {
        let cipher = CredentialCipher::from_secret("test-secret");
        let encrypted = cipher.encrypt("my-api-key-123").unwrap();

        assert!(!encrypted.contains("my-api-key-123"));
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "my-api-key-123");
    }

    #[test]
    fn each_encryption_uses_a_fresh_nonce() {
        let cipher = CredentialCipher::from_secret("test-secret");
        let a = cipher.encrypt("same-input").unwrap();
        let b = cipher.encrypt("same-input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let cipher = CredentialCipher::from_secret("right-key");
        let encrypted = cipher.encrypt("secret-value").unwrap();

        let other = CredentialCipher::from_secret("wrong-key");
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let cipher = CredentialCipher::from_secret("key");
        let mut encrypted = cipher.encrypt("value").unwrap();
        // Flip the last hex digit.
        let flipped = if encrypted.ends_with('0') { '1' } else { '0' };
        encrypted.pop();
        encrypted.push(flipped);
        assert!(cipher.decrypt(&encrypted).is_err());
    }
}
