//! Confidentiality for signaling payloads crossing the relay.
//!
//! Every client shares one static passphrase, configured out of band. The
//! AES-256-GCM key is its SHA-256 digest. This gives no forward secrecy and
//! no protection from anyone who holds the passphrase, the relay operator
//! included.

use crate::utils::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Clone)]
pub struct SignalCodec {
    cipher: Aes256Gcm,
}

impl SignalCodec {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Returns base64 of `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Decode("encryption failed".to_string()))?;

        let mut framed = Vec::with_capacity(NONCE_LEN + sealed.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&sealed);
        Ok(STANDARD.encode(framed))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>> {
        let framed = STANDARD
            .decode(ciphertext)
            .map_err(|e| Error::Decode(format!("invalid base64: {}", e)))?;
        if framed.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Decode(format!(
                "ciphertext too short ({} bytes)",
                framed.len()
            )));
        }

        let (nonce, sealed) = framed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| Error::Decode("authentication failed".to_string()))
    }

    pub fn seal<T: Serialize>(&self, value: &T) -> Result<String> {
        let plaintext = serde_json::to_vec(value)?;
        self.encrypt(&plaintext)
    }

    pub fn open<T: DeserializeOwned>(&self, ciphertext: &str) -> Result<T> {
        let plaintext = self.decrypt(ciphertext)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| Error::Decode(format!("payload is not valid JSON: {}", e)))
    }
}

impl std::fmt::Debug for SignalCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SignalCodec { .. }")
    }
}
