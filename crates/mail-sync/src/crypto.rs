//! Encryption of stored OAuth tokens
//!
//! Access and refresh tokens are persisted encrypted. The engine only needs
//! a [`CredentialCipher`]; [`AesGcmCipher`] is the default implementation.
//!
//! Encrypted values are base64(nonce || ciphertext) with a random 96-bit
//! nonce per value.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::debug;
use thiserror::Error;

use crate::provider::TokenSet;

/// AES-GCM nonce size (96 bits)
const NONCE_SIZE: usize = 12;

/// AES-256 key size
const KEY_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid ciphertext format: {0}")]
    InvalidFormat(String),
}

/// Symmetric encryption of credential strings
pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError>;

    fn decrypt(&self, encrypted: &str) -> Result<String, CipherError>;
}

/// AES-256-GCM cipher with a process-wide key
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Build from a base64-encoded 32-byte key
    pub fn from_base64_key(encoded: &str) -> Result<Self, CipherError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| CipherError::InvalidKey(format!("not valid base64: {}", e)))?;
        let key: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            CipherError::InvalidKey(format!("expected {} bytes, got {}", KEY_SIZE, bytes.len()))
        })?;
        Ok(Self::new(&key))
    }
}

impl CredentialCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CipherError::Encryption(format!("AES-GCM encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(&combined))
    }

    fn decrypt(&self, encrypted: &str) -> Result<String, CipherError> {
        let combined = BASE64
            .decode(encrypted)
            .map_err(|e| CipherError::InvalidFormat(format!("Invalid base64 encoding: {}", e)))?;

        if combined.len() <= NONCE_SIZE {
            return Err(CipherError::InvalidFormat(format!(
                "Encrypted data too short: {} bytes",
                combined.len()
            )));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                CipherError::Decryption("wrong key or corrupted data".to_string())
            })?;

        String::from_utf8(plaintext)
            .map_err(|e| CipherError::Decryption(format!("Decrypted data is not valid UTF-8: {}", e)))
    }
}

/// Encrypt both halves of a token pair, returning (access, refresh)
pub fn seal_tokens(
    cipher: &dyn CredentialCipher,
    tokens: &TokenSet,
) -> Result<(String, String), CipherError> {
    let access = cipher.encrypt(&tokens.access_token)?;
    let refresh = cipher.encrypt(&tokens.refresh_token)?;
    debug!("Sealed token pair expiring at {}", tokens.expires_at);
    Ok((access, refresh))
}

/// Decrypt a stored token pair
pub fn open_tokens(
    cipher: &dyn CredentialCipher,
    encrypted_access: &str,
    encrypted_refresh: &str,
    expires_at: chrono::DateTime<chrono::Utc>,
) -> Result<TokenSet, CipherError> {
    Ok(TokenSet::new(
        cipher.decrypt(encrypted_access)?,
        cipher.decrypt(encrypted_refresh)?,
        expires_at,
    ))
}
