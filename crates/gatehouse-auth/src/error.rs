//! Authentication and session-security error types.
//!
//! [`AuthError`] is the outcome value handed to the routing layer. Its
//! variants follow the engine's error taxonomy (not-found, expired,
//! invalid-credentials, replay-detected, unavailable) plus the infrastructure
//! failures a host needs to tell apart from client errors.
//!
//! Messages carried inside the variants are meant for logs. The text that
//! reaches a remote caller comes from [`AuthError::public_message`], which
//! never includes validation internals.

use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;

/// Result type for engine operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors produced by the authentication engine.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The requested state, session or record does not exist.
    #[error("Not found: {message}")]
    NotFound {
        /// What was looked up.
        message: String,
    },

    /// The record exists but its TTL has passed.
    #[error("Expired: {message}")]
    Expired {
        /// What expired.
        message: String,
    },

    /// Signature, issuer, audience, nonce or credential mismatch.
    #[error("Invalid credentials: {message}")]
    InvalidCredentials {
        /// Specific cause, for operators only.
        message: String,
    },

    /// The authorization state is unknown, expired or already consumed.
    #[error("Invalid or expired state")]
    InvalidState,

    /// A single-use token was presented a second time.
    #[error("Replay detected: {message}")]
    ReplayDetected {
        /// Identifies the replayed token.
        message: String,
    },

    /// The request was refused (CSRF or ownership failure).
    #[error("Forbidden: {message}")]
    Forbidden {
        /// Description of the refusal.
        message: String,
    },

    /// The principal or source address is locked out.
    #[error("Locked out for {remaining:?}")]
    Locked {
        /// Time left until the lockout ends.
        remaining: Duration,
    },

    /// The provider is not configured or could not be reached.
    #[error("Service unavailable: {message}")]
    Unavailable {
        /// Description of the unavailable dependency.
        message: String,
    },

    /// Storage backend failure.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// Invalid or missing configuration.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration error.
        message: String,
    },

    /// Encryption or key derivation failure.
    #[error("Crypto error: {message}")]
    Crypto {
        /// Description of the failure.
        message: String,
    },

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Creates a new `Expired` error.
    #[must_use]
    pub fn expired(message: impl Into<String>) -> Self {
        Self::Expired {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidCredentials` error.
    #[must_use]
    pub fn invalid_credentials(message: impl Into<String>) -> Self {
        Self::InvalidCredentials {
            message: message.into(),
        }
    }

    /// Creates a new `ReplayDetected` error.
    #[must_use]
    pub fn replay_detected(message: impl Into<String>) -> Self {
        Self::ReplayDetected {
            message: message.into(),
        }
    }

    /// Creates a new `Forbidden` error.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Creates a new `Locked` error.
    #[must_use]
    pub fn locked(remaining: Duration) -> Self {
        Self::Locked { remaining }
    }

    /// Creates a new `Unavailable` error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a new `Storage` error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Crypto` error.
    #[must_use]
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` for "no usable auth" outcomes: not-found and expired.
    ///
    /// Callers treat both the same way; the distinction only matters for
    /// diagnostics.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Expired { .. })
    }

    /// Returns `true` if this is a client error (4xx category).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Returns `true` if this is a server error (5xx category).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Returns `true` if this error must always be logged and counted.
    #[must_use]
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            Self::ReplayDetected { .. } | Self::Locked { .. } | Self::Forbidden { .. }
        )
    }

    /// Returns the error category for logging and monitoring.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Expired { .. } => ErrorCategory::Expired,
            Self::InvalidCredentials { .. } | Self::InvalidState => {
                ErrorCategory::InvalidCredentials
            }
            Self::ReplayDetected { .. } => ErrorCategory::ReplayDetected,
            Self::Forbidden { .. } => ErrorCategory::Forbidden,
            Self::Locked { .. } => ErrorCategory::RateLimited,
            Self::Unavailable { .. } => ErrorCategory::Unavailable,
            Self::Storage { .. }
            | Self::Configuration { .. }
            | Self::Crypto { .. }
            | Self::Internal { .. } => ErrorCategory::Infrastructure,
        }
    }

    /// HTTP status the routing layer should answer with.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self.category() {
            ErrorCategory::NotFound
            | ErrorCategory::Expired
            | ErrorCategory::InvalidCredentials
            | ErrorCategory::ReplayDetected => StatusCode::UNAUTHORIZED,
            ErrorCategory::Forbidden => StatusCode::FORBIDDEN,
            ErrorCategory::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCategory::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCategory::Infrastructure => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Generic message safe to send to a remote caller.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::NotFound { .. } | Self::Expired { .. } => "authentication required",
            Self::InvalidCredentials { .. } | Self::ReplayDetected { .. } => "invalid credentials",
            Self::InvalidState => "invalid or expired state parameter",
            Self::Forbidden { .. } => "forbidden",
            Self::Locked { .. } => "too many failed attempts",
            Self::Unavailable { .. } => "authentication provider unavailable",
            Self::Storage { .. }
            | Self::Configuration { .. }
            | Self::Crypto { .. }
            | Self::Internal { .. } => "internal error",
        }
    }
}

/// Categories of engine errors for logging, metrics and status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Record absent.
    NotFound,
    /// Record present but past its TTL.
    Expired,
    /// Validation or credential mismatch.
    InvalidCredentials,
    /// Single-use token replayed.
    ReplayDetected,
    /// CSRF or ownership refusal.
    Forbidden,
    /// Lockout or rate limit.
    RateLimited,
    /// Provider not configured or unreachable.
    Unavailable,
    /// Storage, configuration, crypto or internal failure.
    Infrastructure,
}

impl ErrorCategory {
    /// Stable label used in metrics and response bodies.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::InvalidCredentials => "invalid_credentials",
            Self::ReplayDetected => "replay_detected",
            Self::Forbidden => "forbidden",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Infrastructure => "infrastructure",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AuthError::not_found("session abc");
        assert_eq!(err.to_string(), "Not found: session abc");

        let err = AuthError::InvalidState;
        assert_eq!(err.to_string(), "Invalid or expired state");

        let err = AuthError::invalid_credentials("issuer mismatch: got x, want y");
        assert_eq!(
            err.to_string(),
            "Invalid credentials: issuer mismatch: got x, want y"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AuthError::not_found("x").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::expired("x").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::replay_detected("jti").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::forbidden("csrf").status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AuthError::locked(Duration::from_secs(60)).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AuthError::unavailable("no provider").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AuthError::storage("down").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_predicates() {
        assert!(AuthError::not_found("x").is_absent());
        assert!(AuthError::expired("x").is_absent());
        assert!(!AuthError::InvalidState.is_absent());

        assert!(AuthError::forbidden("x").is_client_error());
        assert!(AuthError::storage("x").is_server_error());
        assert!(AuthError::replay_detected("x").is_security_event());
        assert!(!AuthError::not_found("x").is_security_event());
    }

    #[test]
    fn test_public_message_hides_details() {
        let err = AuthError::invalid_credentials("audience [a, b] missing client-1");
        assert_eq!(err.public_message(), "invalid credentials");
        assert!(!err.public_message().contains("client-1"));

        let err = AuthError::replay_detected("jti-123");
        assert_eq!(err.public_message(), "invalid credentials");
    }

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::ReplayDetected.to_string(), "replay_detected");
        assert_eq!(ErrorCategory::RateLimited.to_string(), "rate_limited");
        assert_eq!(
            AuthError::InvalidState.category(),
            ErrorCategory::InvalidCredentials
        );
    }
}
