//! Token-at-rest encryption.
//!
//! OAuth tokens kept in session metadata are sealed with AES-256-GCM. The
//! cipher key is derived from the configured master key with HKDF-SHA256 and
//! a context string, so rotating the context yields an unrelated key.
//!
//! Output layout: `base64(nonce(12) || ciphertext || tag(16))`.
//!
//! Without a master key the encryptor passes values through unchanged, so
//! call sites are identical in both modes.

use std::collections::HashMap;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::config::EncryptionConfig;
use crate::error::AuthError;

/// Context string bound into the derived key by default.
pub const DEFAULT_CONTEXT: &str = "gatehouse-token-encryption-v1";

/// Minimum decoded master key length.
pub const MIN_MASTER_KEY_LEN: usize = 16;

/// Session metadata fields that hold tokens.
pub const SENSITIVE_FIELDS: [&str; 3] = ["access_token", "refresh_token", "id_token"];

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const KEY_SIZE: usize = 32;

/// Encryption failures.
#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    /// The master key is malformed or too short.
    #[error("Invalid master key: {0}")]
    InvalidKey(String),

    /// Sealing failed.
    #[error("Encryption failed: {0}")]
    Encrypt(String),

    /// The input is not valid base64 or fails authentication.
    #[error("Decryption failed: {0}")]
    Decrypt(String),

    /// The input cannot hold a nonce and a tag.
    #[error("Ciphertext too short: {0} bytes")]
    TooShort(usize),
}

impl From<EncryptionError> for AuthError {
    fn from(err: EncryptionError) -> Self {
        AuthError::crypto(err.to_string())
    }
}

/// Seals and opens token strings.
#[derive(Clone)]
pub struct TokenEncryptor {
    cipher: Option<Aes256Gcm>,
}

impl std::fmt::Debug for TokenEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEncryptor")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl TokenEncryptor {
    /// Builds an encryptor from configuration.
    ///
    /// A missing or empty master key yields a disabled encryptor.
    ///
    /// # Errors
    ///
    /// Returns `EncryptionError::InvalidKey` if the key is not base64 or
    /// decodes to fewer than 16 bytes.
    pub fn from_config(config: &EncryptionConfig) -> Result<Self, EncryptionError> {
        match config.master_key.as_deref() {
            Some(key) if !key.is_empty() => Self::new(key, &config.context),
            _ => Ok(Self::disabled()),
        }
    }

    /// Derives the cipher key from a base64 master key and a context string.
    ///
    /// # Errors
    ///
    /// Returns `EncryptionError::InvalidKey` for a malformed or short key.
    pub fn new(master_key_b64: &str, context: &str) -> Result<Self, EncryptionError> {
        let master = BASE64
            .decode(master_key_b64.trim())
            .map_err(|e| EncryptionError::InvalidKey(format!("invalid base64: {e}")))?;
        if master.len() < MIN_MASTER_KEY_LEN {
            return Err(EncryptionError::InvalidKey(format!(
                "need at least {MIN_MASTER_KEY_LEN} bytes, got {}",
                master.len()
            )));
        }

        let mut key = [0u8; KEY_SIZE];
        Hkdf::<Sha256>::new(None, &master)
            .expand(context.as_bytes(), &mut key)
            .map_err(|e| EncryptionError::InvalidKey(format!("key derivation failed: {e}")))?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| EncryptionError::InvalidKey(format!("failed to create cipher: {e}")))?;

        Ok(Self {
            cipher: Some(cipher),
        })
    }

    /// An encryptor that passes values through unchanged.
    #[must_use]
    pub fn disabled() -> Self {
        Self { cipher: None }
    }

    /// Returns `true` when a master key is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Seals `plaintext` with a fresh random nonce.
    ///
    /// Empty input and a disabled encryptor return the input unchanged.
    ///
    /// # Errors
    ///
    /// Returns `EncryptionError::Encrypt` if the AEAD operation fails.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, EncryptionError> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_string());
        };
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| EncryptionError::Encrypt(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    /// Opens a value produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns `EncryptionError::TooShort` when the decoded input is shorter
    /// than nonce plus tag and `EncryptionError::Decrypt` when it is not
    /// base64, fails authentication or is not UTF-8.
    pub fn decrypt(&self, encoded: &str) -> Result<String, EncryptionError> {
        let Some(cipher) = &self.cipher else {
            return Ok(encoded.to_string());
        };
        if encoded.is_empty() {
            return Ok(String::new());
        }

        let data = BASE64
            .decode(encoded)
            .map_err(|e| EncryptionError::Decrypt(format!("invalid base64: {e}")))?;
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(EncryptionError::TooShort(data.len()));
        }

        let (nonce_bytes, sealed) = data.split_at(NONCE_SIZE);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|e| EncryptionError::Decrypt(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| EncryptionError::Decrypt(format!("invalid UTF-8: {e}")))
    }

    /// Seals the token fields of a metadata map; other fields are copied.
    ///
    /// # Errors
    ///
    /// Propagates the first encryption failure.
    pub fn encrypt_metadata(
        &self,
        metadata: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, EncryptionError> {
        let mut out = metadata.clone();
        if !self.is_enabled() {
            return Ok(out);
        }
        for field in SENSITIVE_FIELDS {
            if let Some(value) = metadata.get(field) {
                out.insert(field.to_string(), self.encrypt(value)?);
            }
        }
        Ok(out)
    }

    /// Opens the token fields of a metadata map.
    ///
    /// A field that fails to decrypt but looks like a JWT was written before
    /// encryption was enabled and is returned as-is.
    ///
    /// # Errors
    ///
    /// Returns the decryption error for any other undecryptable field.
    pub fn decrypt_metadata(
        &self,
        metadata: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, EncryptionError> {
        let mut out = metadata.clone();
        if !self.is_enabled() {
            return Ok(out);
        }
        for field in SENSITIVE_FIELDS {
            let Some(value) = metadata.get(field) else {
                continue;
            };
            match self.decrypt(value) {
                Ok(plain) => {
                    out.insert(field.to_string(), plain);
                }
                Err(_) if looks_like_jwt(value) => {
                    tracing::debug!(field, "keeping unencrypted legacy token value");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

/// Three non-empty dot-separated parts.
#[must_use]
pub fn looks_like_jwt(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty())
}

/// Generates a random 32-byte master key, base64 encoded.
#[must_use]
pub fn generate_encryption_key() -> String {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    BASE64.encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encryptor() -> TokenEncryptor {
        TokenEncryptor::new(&generate_encryption_key(), DEFAULT_CONTEXT).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let enc = encryptor();
        for plaintext in ["a", "refresh-token-value", "ünïcødé ✓", "x".repeat(4096).as_str()] {
            let sealed = enc.encrypt(plaintext).unwrap();
            assert_ne!(sealed, plaintext);
            assert_eq!(enc.decrypt(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let enc = encryptor();
        let a = enc.encrypt("same").unwrap();
        let b = enc.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_passthrough() {
        let enc = encryptor();
        assert_eq!(enc.encrypt("").unwrap(), "");
        assert_eq!(enc.decrypt("").unwrap(), "");
    }

    #[test]
    fn test_disabled_passthrough() {
        let enc = TokenEncryptor::disabled();
        assert!(!enc.is_enabled());
        assert_eq!(enc.encrypt("token").unwrap(), "token");
        assert_eq!(enc.decrypt("token").unwrap(), "token");

        let enc = TokenEncryptor::from_config(&EncryptionConfig::default()).unwrap();
        assert!(!enc.is_enabled());
    }

    #[test]
    fn test_rejects_short_ciphertext() {
        let enc = encryptor();
        let short = BASE64.encode([0u8; NONCE_SIZE + TAG_SIZE - 1]);
        assert!(matches!(
            enc.decrypt(&short),
            Err(EncryptionError::TooShort(27))
        ));
    }

    #[test]
    fn test_rejects_tampered_ciphertext() {
        let enc = encryptor();
        let sealed = enc.encrypt("secret").unwrap();
        let mut bytes = BASE64.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            enc.decrypt(&BASE64.encode(bytes)),
            Err(EncryptionError::Decrypt(_))
        ));
    }

    #[test]
    fn test_context_separates_keys() {
        let master = generate_encryption_key();
        let a = TokenEncryptor::new(&master, "context-a").unwrap();
        let b = TokenEncryptor::new(&master, "context-b").unwrap();
        let sealed = a.encrypt("secret").unwrap();
        assert!(b.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_invalid_master_keys() {
        assert!(matches!(
            TokenEncryptor::new("!!!", DEFAULT_CONTEXT),
            Err(EncryptionError::InvalidKey(_))
        ));
        let short = BASE64.encode([1u8; 15]);
        assert!(matches!(
            TokenEncryptor::new(&short, DEFAULT_CONTEXT),
            Err(EncryptionError::InvalidKey(_))
        ));
        let min = BASE64.encode([1u8; 16]);
        assert!(TokenEncryptor::new(&min, DEFAULT_CONTEXT).is_ok());
    }

    #[test]
    fn test_metadata_only_touches_token_fields() {
        let enc = encryptor();
        let mut metadata = HashMap::new();
        metadata.insert("access_token".to_string(), "at".to_string());
        metadata.insert("refresh_token".to_string(), "rt".to_string());
        metadata.insert("theme".to_string(), "dark".to_string());

        let sealed = enc.encrypt_metadata(&metadata).unwrap();
        assert_ne!(sealed["access_token"], "at");
        assert_ne!(sealed["refresh_token"], "rt");
        assert_eq!(sealed["theme"], "dark");
        assert!(!sealed.contains_key("id_token"));

        let opened = enc.decrypt_metadata(&sealed).unwrap();
        assert_eq!(opened, metadata);
    }

    #[test]
    fn test_metadata_keeps_legacy_jwt() {
        let enc = encryptor();
        let mut metadata = HashMap::new();
        metadata.insert("id_token".to_string(), "eyJhbGc.eyJzdWIi.c2ln".to_string());

        let opened = enc.decrypt_metadata(&metadata).unwrap();
        assert_eq!(opened["id_token"], "eyJhbGc.eyJzdWIi.c2ln");

        metadata.insert("access_token".to_string(), "garbage".to_string());
        assert!(enc.decrypt_metadata(&metadata).is_err());
    }

    #[test]
    fn test_looks_like_jwt() {
        assert!(looks_like_jwt("a.b.c"));
        assert!(!looks_like_jwt("a.b"));
        assert!(!looks_like_jwt("a..c"));
        assert!(!looks_like_jwt("a.b.c.d"));
    }

    #[test]
    fn test_into_auth_error() {
        let err: AuthError = EncryptionError::TooShort(3).into();
        assert!(matches!(err, AuthError::Crypto { .. }));
    }
}
