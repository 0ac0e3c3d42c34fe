//! Normalized authenticated-principal record.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// How the principal authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// OpenID Connect authorization-code flow.
    Oidc,
    /// Static credentials checked by the host.
    Basic,
    /// Personal access token checked by the host.
    Token,
}

impl AuthMethod {
    /// Stable label for logs and session records.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oidc => "oidc",
            Self::Basic => "basic",
            Self::Token => "token",
        }
    }
}

/// Authenticated principal, produced by the ID token validator (or a host
/// authenticator) and consumed to create a session. Never stored directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable subject identifier (`sub`).
    pub subject: String,
    /// Display name resolved from the configured claims.
    pub username: String,
    /// Email address, if the provider sent one.
    pub email: Option<String>,
    /// Whether the provider vouches for the email.
    pub email_verified: bool,
    /// Role names.
    pub roles: Vec<String>,
    /// Group names.
    pub groups: Vec<String>,
    /// Token issuer.
    pub issuer: String,
    /// Provider label.
    pub provider: String,
    /// Authentication method.
    pub auth_method: AuthMethod,
    /// Token `iat`, when present.
    pub issued_at: Option<OffsetDateTime>,
    /// Token `exp`.
    pub expires_at: Option<OffsetDateTime>,
    /// Every claim from the token, untouched.
    pub raw_claims: serde_json::Map<String, serde_json::Value>,
}

impl Identity {
    /// Returns `true` if the principal holds `role`.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Returns `true` if the principal holds any of `roles`.
    #[must_use]
    pub fn has_any_role(&self, roles: &[&str]) -> bool {
        roles.iter().any(|role| self.has_role(role))
    }

    /// Returns `true` if the principal belongs to `group`.
    #[must_use]
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}
