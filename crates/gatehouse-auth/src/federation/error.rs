//! Detailed error types for provider operations.
//!
//! These keep the specific cause of a failure (which claim mismatched, which
//! status the token endpoint answered with). They never leave the engine as
//! is: the `From` conversions into [`AuthError`] log the detail and collapse
//! it to a generic category.

use crate::error::AuthError;

/// Errors fetching or using the provider key set.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JwksError {
    /// No key set endpoint is known yet.
    #[error("JWKS endpoint not configured")]
    NotConfigured,

    /// The key set could not be fetched.
    #[error("Network error: {0}")]
    Network(String),

    /// The endpoint answered with a non-success status.
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),

    /// The response was not a key set document.
    #[error("Failed to parse JWKS: {0}")]
    Parse(String),

    /// The response exceeded the size limit.
    #[error("Response exceeds maximum size of {max_size} bytes")]
    ResponseTooLarge {
        /// The maximum allowed size.
        max_size: usize,
    },

    /// No usable key carries this id.
    #[error("Key not found: {0}")]
    KeyNotFound(String),
}

impl JwksError {
    /// Returns `true` if the provider could not be reached or misbehaved.
    #[must_use]
    pub fn is_fetch_error(&self) -> bool {
        !matches!(self, Self::KeyNotFound(_))
    }
}

impl From<JwksError> for AuthError {
    fn from(err: JwksError) -> Self {
        if err.is_fetch_error() {
            tracing::warn!(error = %err, "provider keys unavailable");
            AuthError::unavailable("provider keys unavailable")
        } else {
            tracing::warn!(error = %err, "token signed with unknown key");
            AuthError::invalid_credentials(err.to_string())
        }
    }
}

/// Errors validating a signed provider token.
#[derive(Debug, thiserror::Error)]
pub enum TokenValidationError {
    /// The token header could not be decoded.
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// The header has no `kid`.
    #[error("Token is missing key ID (kid) header")]
    MissingKeyId,

    /// The header names an algorithm outside the RSA family.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The key could not be resolved.
    #[error("Key error: {0}")]
    Key(#[from] JwksError),

    /// Signature verification or claim decoding failed.
    #[error("Signature verification failed: {0}")]
    Signature(String),

    /// `iss` differs from the configured issuer.
    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Configured issuer.
        expected: String,
        /// Issuer found in the token.
        actual: String,
    },

    /// `aud` does not contain the client id.
    #[error("Audience mismatch: expected {expected}, got {actual}")]
    AudienceMismatch {
        /// Configured client id.
        expected: String,
        /// Audience found in the token, JSON-encoded.
        actual: String,
    },

    /// `exp` has passed.
    #[error("Token has expired")]
    Expired,

    /// `nbf` is in the future.
    #[error("Token is not yet valid")]
    NotYetValid,

    /// A required claim is absent or has the wrong type.
    #[error("Missing or invalid claim: {0}")]
    MissingClaim(&'static str),

    /// The `nonce` claim differs from the stored one.
    #[error("Nonce mismatch")]
    NonceMismatch,

    /// A logout token broke one of the logout token rules.
    #[error("Invalid logout token: {0}")]
    InvalidLogoutToken(&'static str),
}

impl TokenValidationError {
    /// Builds an `IssuerMismatch`.
    #[must_use]
    pub fn issuer_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::IssuerMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

impl From<TokenValidationError> for AuthError {
    fn from(err: TokenValidationError) -> Self {
        match err {
            TokenValidationError::Key(inner) => inner.into(),
            other => {
                tracing::warn!(error = %other, "token validation failed");
                AuthError::invalid_credentials(other.to_string())
            }
        }
    }
}

/// Errors talking to the provider's OIDC endpoints.
#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    /// An endpoint the operation needs has not been configured or discovered.
    #[error("{0} endpoint not configured")]
    NotConfigured(&'static str),

    /// The request did not complete.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-success status without an OAuth error body.
    #[error("HTTP error: status {status}")]
    HttpStatus {
        /// Status code.
        status: u16,
        /// Response body, for logs.
        body: String,
    },

    /// The provider answered with an OAuth error response.
    #[error("OAuth error from provider: {error} - {description}")]
    OAuth {
        /// OAuth `error` code.
        error: String,
        /// Optional `error_description`.
        description: String,
    },

    /// A response body could not be parsed.
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// A URL could not be parsed.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Discovery returned a document for another issuer.
    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Configured issuer.
        expected: String,
        /// Issuer in the document.
        actual: String,
    },

    /// The token response had no `id_token`.
    #[error("Token response is missing id_token")]
    MissingIdToken,
}

impl OidcError {
    /// Builds an `OAuth` error.
    #[must_use]
    pub fn oauth(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self::OAuth {
            error: error.into(),
            description: description.into(),
        }
    }

    /// Returns `true` if the provider rejected what the client sent, as
    /// opposed to being unreachable or broken.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        match self {
            Self::OAuth { .. } | Self::MissingIdToken => true,
            Self::HttpStatus { status, .. } => (400..500).contains(status),
            _ => false,
        }
    }
}

impl From<OidcError> for AuthError {
    fn from(err: OidcError) -> Self {
        if err.is_rejection() {
            tracing::warn!(error = %err, "provider rejected request");
            AuthError::invalid_credentials(err.to_string())
        } else {
            tracing::warn!(error = %err, "provider unavailable");
            AuthError::unavailable(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TokenValidationError::issuer_mismatch("https://a.example", "https://b.example");
        assert!(err.to_string().contains("https://a.example"));
        assert!(err.to_string().contains("https://b.example"));

        let err = OidcError::oauth("invalid_grant", "code expired");
        assert!(err.to_string().contains("invalid_grant"));
        assert!(err.to_string().contains("code expired"));

        assert_eq!(
            OidcError::NotConfigured("token").to_string(),
            "token endpoint not configured"
        );
    }

    #[test]
    fn test_jwks_error_mapping() {
        let err: AuthError = JwksError::Network("connection refused".to_string()).into();
        assert!(matches!(err, AuthError::Unavailable { .. }));

        let err: AuthError = JwksError::KeyNotFound("kid-9".to_string()).into();
        assert!(matches!(err, AuthError::InvalidCredentials { .. }));
    }

    #[test]
    fn test_validation_error_mapping() {
        let err: AuthError = TokenValidationError::NonceMismatch.into();
        assert!(matches!(err, AuthError::InvalidCredentials { .. }));
        assert_eq!(err.public_message(), "invalid credentials");

        let err: AuthError = TokenValidationError::Key(JwksError::HttpStatus(502)).into();
        assert!(matches!(err, AuthError::Unavailable { .. }));
    }

    #[test]
    fn test_oidc_error_mapping() {
        let err: AuthError = OidcError::oauth("invalid_grant", "").into();
        assert!(matches!(err, AuthError::InvalidCredentials { .. }));

        let err: AuthError = OidcError::HttpStatus {
            status: 400,
            body: String::new(),
        }
        .into();
        assert!(matches!(err, AuthError::InvalidCredentials { .. }));

        let err: AuthError = OidcError::HttpStatus {
            status: 503,
            body: String::new(),
        }
        .into();
        assert!(matches!(err, AuthError::Unavailable { .. }));

        let err: AuthError = OidcError::NotConfigured("authorization").into();
        assert!(matches!(err, AuthError::Unavailable { .. }));
    }
}
