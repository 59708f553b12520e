// src/processing/encryptor.rs
//! Authenticated encryption at rest
//!
//! Envelope layout:
//!
//! ```text
//! | magic "ALE1" (4) | nonce (12) | ChaCha20-Poly1305 ciphertext + tag |
//! ```
//!
//! A payload is either sealed or plain; mixing the two with the wrong
//! configuration is reported as an error instead of being passed through.

use crate::utils::errors::{EngineError, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use tracing::debug;

const MAGIC: &[u8; 4] = b"ALE1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Optional ChaCha20-Poly1305 encryptor
pub struct Encryptor {
    cipher: Option<ChaCha20Poly1305>,
}

impl Encryptor {
    /// Build an encryptor; a base64 32-byte key is required when enabled
    pub fn new(enabled: bool, key: Option<&str>) -> Result<Self> {
        if !enabled {
            return Ok(Self { cipher: None });
        }

        let key = key.ok_or_else(|| {
            EngineError::Config("Encryption key is required when encryption is enabled".to_string())
        })?;

        let bytes = STANDARD
            .decode(key.trim())
            .or_else(|_| URL_SAFE.decode(key.trim()))
            .map_err(|e| EngineError::Config(format!("Invalid encryption key: {}", e)))?;

        if bytes.len() != KEY_LEN {
            return Err(EngineError::Config(format!(
                "Invalid encryption key: expected {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }

        Ok(Self {
            cipher: Some(ChaCha20Poly1305::new(Key::from_slice(&bytes))),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Generate a fresh base64-encoded key
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        STANDARD.encode(key)
    }

    pub fn is_encrypted(data: &[u8]) -> bool {
        data.starts_with(MAGIC)
    }

    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(data.to_vec());
        };

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), data)
            .map_err(|e| EngineError::EncryptionFailed(format!("Encryption error: {}", e)))?;

        let mut sealed = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(MAGIC);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);

        debug!("Encrypted {} bytes -> {} bytes", data.len(), sealed.len());
        Ok(sealed)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let sealed = Self::is_encrypted(data);

        let cipher = match (&self.cipher, sealed) {
            (None, false) => return Ok(data.to_vec()),
            (None, true) => {
                return Err(EngineError::DecryptionFailed(
                    "Payload is encrypted but encryption is disabled".to_string(),
                ))
            }
            (Some(_), false) => {
                return Err(EngineError::DecryptionFailed(
                    "Payload is not encrypted but encryption is enabled".to_string(),
                ))
            }
            (Some(cipher), true) => cipher,
        };

        if data.len() < MAGIC.len() + NONCE_LEN + TAG_LEN {
            return Err(EngineError::DecryptionFailed(format!(
                "Encrypted payload truncated ({} bytes)",
                data.len()
            )));
        }

        let (nonce, ciphertext) = data[MAGIC.len()..].split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                EngineError::DecryptionFailed(
                    "Authentication failed (wrong key or tampered payload)".to_string(),
                )
            })
    }
}
