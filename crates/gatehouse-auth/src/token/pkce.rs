//! Client-side PKCE (RFC 7636), S256 only.
//!
//! The flow generates a [`PkcePair`] per login attempt, sends the challenge
//! with the authorization request and keeps the verifier in the stored
//! authorization state until the code exchange.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};

/// The only challenge method this client sends.
pub const CHALLENGE_METHOD: &str = "S256";

const VERIFIER_LEN: std::ops::RangeInclusive<usize> = 43..=128;

/// Errors for externally supplied verifiers.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PkceError {
    /// Verifier length is outside 43..=128.
    #[error("Invalid verifier length: must be 43-128 characters, got {0}")]
    InvalidVerifierLength(usize),

    /// Verifier uses characters outside `[A-Za-z0-9-._~]`.
    #[error("Invalid verifier characters: must be unreserved URL characters")]
    InvalidVerifierCharacters,
}

/// A code verifier together with its S256 challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkcePair {
    verifier: String,
    challenge: String,
}

impl PkcePair {
    /// Generates a pair from 32 random bytes (43-character verifier).
    #[must_use]
    pub fn generate() -> Self {
        use rand::Rng;
        let bytes: [u8; 32] = rand::thread_rng().r#gen();
        let verifier = URL_SAFE_NO_PAD.encode(bytes);
        let challenge = challenge_for(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    /// Builds a pair from an existing verifier.
    ///
    /// # Errors
    ///
    /// Returns `PkceError` if the verifier violates RFC 7636 section 4.1.
    pub fn from_verifier(verifier: impl Into<String>) -> Result<Self, PkceError> {
        let verifier = verifier.into();
        if !VERIFIER_LEN.contains(&verifier.len()) {
            return Err(PkceError::InvalidVerifierLength(verifier.len()));
        }
        if !verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
        {
            return Err(PkceError::InvalidVerifierCharacters);
        }
        let challenge = challenge_for(&verifier);
        Ok(Self {
            verifier,
            challenge,
        })
    }

    /// The secret half, sent only with the token request.
    #[must_use]
    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    /// The public half, sent with the authorization request.
    #[must_use]
    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    /// Consumes the pair and keeps the verifier for storage.
    #[must_use]
    pub fn into_verifier(self) -> String {
        self.verifier
    }
}

/// `BASE64URL(SHA256(ASCII(verifier)))`.
#[must_use]
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}
