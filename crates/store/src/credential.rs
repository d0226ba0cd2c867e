//! AES-256-GCM sealing for provider secrets stored in the credential table.
//!
//! A random 12-byte nonce is prepended to the ciphertext and the result is
//! base64-encoded for storage in a text column. The key is 32 bytes,
//! supplied hex-encoded through the environment variable named in
//! `credentials.key_env`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::Rng;

use qm_domain::{Error, Result};

const NONCE_SIZE: usize = 12;

/// Seals and opens credential rows with a fixed key.
#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; 32],
}

impl CredentialCipher {
    /// Build from a 64-hex-character key string.
    pub fn from_hex(key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(key_hex.trim())
            .map_err(|e| Error::Credential(format!("key is not valid hex: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Credential("key must be 32 bytes (64 hex characters)".into()))?;
        Ok(Self { key })
    }

    /// Build from the environment variable `var`.
    pub fn from_env(var: &str) -> Result<Self> {
        let raw = std::env::var(var)
            .map_err(|_| Error::Credential(format!("environment variable {var} is not set")))?;
        Self::from_hex(&raw)
    }

    /// Encrypt a JSON secret blob for storage.
    pub fn seal(&self, secret: &serde_json::Value) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| Error::Credential("invalid key length".into()))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = serde_json::to_vec(secret)?;
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| Error::Credential("encryption failed".into()))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend(ciphertext);
        Ok(BASE64.encode(combined))
    }

    /// Decrypt a stored ciphertext back to the JSON secret blob.
    pub fn open(&self, ciphertext_b64: &str) -> Result<serde_json::Value> {
        let combined = BASE64
            .decode(ciphertext_b64)
            .map_err(|e| Error::Credential(format!("ciphertext is not valid base64: {e}")))?;
        if combined.len() < NONCE_SIZE {
            return Err(Error::Credential("ciphertext too short".into()));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| Error::Credential("invalid key length".into()))?;
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Credential("decryption failed; wrong key or corrupt data".into()))?;

        Ok(serde_json::from_slice(&plaintext)?)
    }
}
