//! Engine configuration.
//!
//! Plain serde structs with defaults for every section. Loading the values
//! (files, environment) is left to the host; these types only describe the
//! shape and validate it.
//!
//! # Example (TOML)
//!
//! ```toml
//! [oidc]
//! issuer = "https://idp.example.com"
//! client_id = "dashboard"
//! redirect_url = "https://app.example.com/auth/callback"
//! state_ttl = "10m"
//!
//! [lockout]
//! max_attempts = 5
//! lockout_duration = "15m"
//! ```

use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use cookie::{Cookie, SameSite};
use serde::{Deserialize, Serialize};

use crate::token::encryption::MIN_MASTER_KEY_LEN;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// OIDC provider and flow settings.
    pub oidc: OidcConfig,

    /// Server-side session settings.
    pub session: SessionConfig,

    /// CSRF double-submit settings.
    pub csrf: CsrfConfig,

    /// Account lockout settings.
    pub lockout: LockoutConfig,

    /// Token-at-rest encryption settings.
    pub encryption: EncryptionConfig,

    /// Back-channel logout replay tracker settings.
    pub replay: ReplayConfig,

    /// Background sweep settings.
    pub cleanup: CleanupConfig,
}

/// OIDC provider and authorization-flow configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OidcConfig {
    /// Provider issuer URL. Discovery appends `/.well-known/openid-configuration`.
    pub issuer: String,

    /// OAuth2 client identifier, also the expected ID token audience.
    pub client_id: String,

    /// Client secret for confidential clients.
    pub client_secret: Option<String>,

    /// Callback URL registered with the provider.
    pub redirect_url: String,

    /// Requested scopes. `openid` is always sent.
    pub scopes: Vec<String>,

    /// Send a PKCE challenge (S256) with the authorization request.
    pub pkce_enabled: bool,

    /// Send a nonce and require it back in the ID token.
    pub nonce_enabled: bool,

    /// Lifetime of a pending authorization state.
    #[serde(with = "humantime_serde")]
    pub state_ttl: Duration,

    /// How long fetched provider keys are trusted before a refresh.
    #[serde(with = "humantime_serde")]
    pub jwks_cache_ttl: Duration,

    /// How long past its TTL a cached key may still be served when the
    /// provider cannot be reached.
    #[serde(with = "humantime_serde")]
    pub jwks_stale_if_error: Duration,

    /// Allowed clock difference when checking `exp`.
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,

    /// Timeout for every provider request.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Claim holding the role list.
    pub roles_claim: String,

    /// Claim holding the group list.
    pub groups_claim: String,

    /// Claims tried in order for the display username.
    pub username_claims: Vec<String>,

    /// Roles assigned when the token carries none.
    pub default_roles: Vec<String>,

    /// Label used for the provider in logs, metrics and sessions.
    pub provider_name: String,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            client_id: String::new(),
            client_secret: None,
            redirect_url: String::new(),
            scopes: vec![
                "openid".to_string(),
                "profile".to_string(),
                "email".to_string(),
            ],
            pkce_enabled: true,
            nonce_enabled: true,
            state_ttl: Duration::from_secs(600),          // 10 minutes
            jwks_cache_ttl: Duration::from_secs(900),     // 15 minutes
            jwks_stale_if_error: Duration::from_secs(3600), // 1 hour
            clock_skew: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            roles_claim: "roles".to_string(),
            groups_claim: "groups".to_string(),
            username_claims: vec![
                "preferred_username".to_string(),
                "name".to_string(),
                "email".to_string(),
            ],
            default_roles: Vec::new(),
            provider_name: "oidc".to_string(),
        }
    }
}

/// Session and session-cookie configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session lifetime; also the sliding extension applied on each use.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Extend `expires_at` on every authenticated request.
    pub sliding_renewal: bool,

    /// Reject the request when the sliding touch fails instead of logging
    /// and proceeding.
    pub fail_closed_on_touch_error: bool,

    /// Session cookie attributes.
    pub cookie: CookieConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 3600),
            sliding_renewal: true,
            fail_closed_on_touch_error: false,
            cookie: CookieConfig::default(),
        }
    }
}

/// Cookie attributes shared by the session and CSRF cookies.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CookieConfig {
    pub name: String,

    pub path: String,

    /// Host-only cookie when unset.
    pub domain: Option<String>,

    /// Send only over HTTPS.
    pub secure: bool,

    /// Hide from scripts.
    pub http_only: bool,

    /// SameSite policy.
    pub same_site: SameSitePolicy,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "session".to_string(),
            path: "/".to_string(),
            domain: None,
            secure: true,
            http_only: true,
            same_site: SameSitePolicy::Lax,
        }
    }
}

impl CookieConfig {
    /// Builds a cookie carrying `value` for `max_age`.
    #[must_use]
    pub fn build_cookie(&self, value: impl Into<String>, max_age: Duration) -> Cookie<'static> {
        let max_age = cookie::time::Duration::try_from(max_age)
            .unwrap_or(cookie::time::Duration::MAX);
        let mut builder = Cookie::build((self.name.clone(), value.into()))
            .path(self.path.clone())
            .secure(self.secure)
            .http_only(self.http_only)
            .same_site(self.same_site.into())
            .max_age(max_age);
        if let Some(domain) = &self.domain {
            builder = builder.domain(domain.clone());
        }
        builder.build()
    }

    /// Builds a cookie that makes the client drop this cookie.
    #[must_use]
    pub fn build_clear_cookie(&self) -> Cookie<'static> {
        self.build_cookie("", Duration::ZERO)
    }
}

impl SessionConfig {
    /// `Set-Cookie` value for a new session.
    #[must_use]
    pub fn session_cookie(&self, session_id: &str) -> Cookie<'static> {
        self.cookie.build_cookie(session_id, self.ttl)
    }

    /// `Set-Cookie` value that removes the session cookie.
    #[must_use]
    pub fn clear_session_cookie(&self) -> Cookie<'static> {
        self.cookie.build_clear_cookie()
    }
}

/// Serializable SameSite policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSitePolicy {
    /// `SameSite=Strict`
    Strict,
    /// `SameSite=Lax`
    Lax,
    /// `SameSite=None`
    None,
}

impl From<SameSitePolicy> for SameSite {
    fn from(policy: SameSitePolicy) -> Self {
        match policy {
            SameSitePolicy::Strict => SameSite::Strict,
            SameSitePolicy::Lax => SameSite::Lax,
            SameSitePolicy::None => SameSite::None,
        }
    }
}

/// CSRF double-submit configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CsrfConfig {
    /// Turn the guard on or off.
    pub enabled: bool,

    /// Request header carrying the resubmitted token.
    pub header_name: String,

    /// Form field carrying the resubmitted token.
    pub form_field: String,

    /// Random bytes per token.
    pub token_length: usize,

    /// Token lifetime in the server-side ledger and cookie.
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,

    /// Methods that are issued a token instead of checked.
    pub exempt_methods: Vec<String>,

    /// Path prefixes skipped entirely.
    pub exempt_paths: Vec<String>,

    /// Token cookie attributes.
    pub cookie: CookieConfig,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            header_name: "X-CSRF-Token".to_string(),
            form_field: "csrf_token".to_string(),
            token_length: 32,
            token_ttl: Duration::from_secs(24 * 3600),
            exempt_methods: vec![
                "GET".to_string(),
                "HEAD".to_string(),
                "OPTIONS".to_string(),
                "TRACE".to_string(),
            ],
            exempt_paths: Vec::new(),
            cookie: CookieConfig {
                name: "_csrf".to_string(),
                path: "/".to_string(),
                domain: None,
                secure: true,
                // The page script reads the cookie to resubmit it.
                http_only: false,
                same_site: SameSitePolicy::Strict,
            },
        }
    }
}

/// Account lockout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockoutConfig {
    /// Turn lockout tracking on or off.
    pub enabled: bool,

    /// Failures that trigger a lockout.
    pub max_attempts: u32,

    /// Base lockout duration.
    #[serde(with = "humantime_serde")]
    pub lockout_duration: Duration,

    /// Double the duration on each subsequent lockout.
    pub exponential_backoff: bool,

    /// Upper bound for a single lockout.
    #[serde(with = "humantime_serde")]
    pub max_lockout_duration: Duration,

    /// Also track failures per source address.
    pub track_by_address: bool,

    /// Sweep interval.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// How long an idle, unlocked entry is kept.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            lockout_duration: Duration::from_secs(15 * 60),
            exponential_backoff: true,
            max_lockout_duration: Duration::from_secs(24 * 3600),
            track_by_address: true,
            cleanup_interval: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Token-at-rest encryption configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Base64 master key (at least 16 bytes decoded). Empty disables encryption.
    pub master_key: Option<String>,

    /// HKDF context string bound into the derived key.
    pub context: String,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            master_key: None,
            context: crate::token::encryption::DEFAULT_CONTEXT.to_string(),
        }
    }
}

/// Replay tracker configuration for back-channel logout tokens.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Retention for a logout token that carries no usable `exp`.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
        }
    }
}

/// Background sweep configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Interval for session, state, CSRF and JTI sweeps.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Why [`AuthConfig::validate`] rejected a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Out of range or malformed; the message names the field.
    #[error("bad config value: {0}")]
    InvalidValue(String),

    /// Empty although an enabled section needs it.
    #[error("config value required: {0}")]
    Missing(String),
}

impl AuthConfig {
    /// Checks cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - OIDC is configured (issuer set) without a client id or redirect URL
    /// - The scopes do not include `openid`
    /// - Lockout is enabled with `max_attempts == 0`
    /// - The CSRF token length is below 16 bytes
    /// - A TTL that must be positive is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.oidc.issuer.is_empty() {
            if self.oidc.client_id.is_empty() {
                return Err(ConfigError::Missing("oidc.client_id".to_string()));
            }
            if self.oidc.redirect_url.is_empty() {
                return Err(ConfigError::Missing("oidc.redirect_url".to_string()));
            }
        }

        if !self.oidc.scopes.iter().any(|s| s == "openid") {
            return Err(ConfigError::InvalidValue(
                "oidc.scopes must include openid".to_string(),
            ));
        }

        if self.oidc.state_ttl.is_zero() {
            return Err(ConfigError::InvalidValue(
                "oidc.state_ttl must be positive".to_string(),
            ));
        }

        if self.session.ttl.is_zero() {
            return Err(ConfigError::InvalidValue(
                "session.ttl must be positive".to_string(),
            ));
        }

        if self.lockout.enabled && self.lockout.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "lockout.max_attempts must be greater than zero".to_string(),
            ));
        }

        if self.lockout.max_lockout_duration < self.lockout.lockout_duration {
            return Err(ConfigError::InvalidValue(
                "lockout.max_lockout_duration is shorter than lockout.lockout_duration"
                    .to_string(),
            ));
        }

        if self.csrf.token_length < 16 {
            return Err(ConfigError::InvalidValue(format!(
                "csrf.token_length must be at least 16 bytes, got {}",
                self.csrf.token_length
            )));
        }

        if self.cleanup.interval.is_zero() || self.lockout.cleanup_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "cleanup intervals must be positive".to_string(),
            ));
        }

        if let Some(key) = self.encryption.master_key.as_deref().filter(|k| !k.is_empty()) {
            let decoded = BASE64_STANDARD.decode(key).map_err(|e| {
                ConfigError::InvalidValue(format!("encryption.master_key is not base64: {e}"))
            })?;
            if decoded.len() < MIN_MASTER_KEY_LEN {
                return Err(ConfigError::InvalidValue(format!(
                    "encryption.master_key must decode to at least {MIN_MASTER_KEY_LEN} bytes, got {}",
                    decoded.len()
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AuthConfig::default();
        assert!(config.validate().is_ok());

        assert_eq!(config.oidc.state_ttl, Duration::from_secs(600));
        assert_eq!(config.oidc.jwks_cache_ttl, Duration::from_secs(900));
        assert_eq!(config.oidc.clock_skew, Duration::from_secs(60));
        assert_eq!(
            config.oidc.username_claims,
            vec!["preferred_username", "name", "email"]
        );

        assert_eq!(config.session.cookie.name, "session");
        assert!(config.session.cookie.secure);
        assert!(config.session.cookie.http_only);
        assert_eq!(config.session.ttl, Duration::from_secs(86400));

        assert_eq!(config.csrf.cookie.name, "_csrf");
        assert_eq!(config.csrf.header_name, "X-CSRF-Token");
        assert_eq!(config.csrf.form_field, "csrf_token");
        assert!(!config.csrf.cookie.http_only);
        assert_eq!(config.csrf.cookie.same_site, SameSitePolicy::Strict);
        assert_eq!(config.csrf.token_length, 32);

        assert_eq!(config.lockout.max_attempts, 5);
        assert_eq!(config.lockout.lockout_duration, Duration::from_secs(900));
        assert_eq!(
            config.lockout.max_lockout_duration,
            Duration::from_secs(86400)
        );
        assert!(config.lockout.track_by_address);

        assert_eq!(config.replay.default_ttl, Duration::from_secs(3600));
        assert!(config.encryption.master_key.is_none());
    }

    #[test]
    fn test_deserialize_toml() {
        let config: AuthConfig = toml::from_str(
            r#"
            [oidc]
            issuer = "https://idp.example.com"
            client_id = "dashboard"
            redirect_url = "https://app.example.com/callback"
            state_ttl = "5m"

            [session.cookie]
            name = "sid"
            same_site = "strict"

            [lockout]
            max_attempts = 3
            lockout_duration = "30m"
            "#,
        )
        .unwrap();

        assert_eq!(config.oidc.client_id, "dashboard");
        assert_eq!(config.oidc.state_ttl, Duration::from_secs(300));
        assert!(config.oidc.pkce_enabled);
        assert_eq!(config.session.cookie.name, "sid");
        assert_eq!(config.session.cookie.same_site, SameSitePolicy::Strict);
        assert_eq!(config.lockout.max_attempts, 3);
        assert_eq!(config.lockout.lockout_duration, Duration::from_secs(1800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_openid_scope() {
        let mut config = AuthConfig::default();
        config.oidc.scopes = vec!["profile".to_string()];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn test_validate_requires_client_id_with_issuer() {
        let mut config = AuthConfig::default();
        config.oidc.issuer = "https://idp.example.com".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn test_validate_lockout_and_csrf() {
        let mut config = AuthConfig::default();
        config.lockout.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AuthConfig::default();
        config.csrf.token_length = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_master_key() {
        let mut config = AuthConfig::default();
        config.encryption.master_key = Some("c2hvcnQ=".to_string()); // "short"
        assert!(config.validate().is_err());

        config.encryption.master_key = Some("not base64!!".to_string());
        assert!(config.validate().is_err());

        config.encryption.master_key =
            Some(BASE64_STANDARD.encode([7u8; 32]));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_session_cookie() {
        let config = SessionConfig::default();
        let cookie = config.session_cookie("abc123").to_string();
        assert!(cookie.starts_with("session=abc123"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("Max-Age=86400"));
        assert!(!cookie.contains("Domain"));
    }

    #[test]
    fn test_clear_cookie_and_domain() {
        let mut config = SessionConfig::default();
        config.cookie.domain = Some("example.com".to_string());
        let cookie = config.clear_session_cookie().to_string();
        assert!(cookie.starts_with("session=;"));
        assert!(cookie.contains("Max-Age=0"));
        assert!(cookie.contains("Domain=example.com"));
    }

    #[test]
    fn test_csrf_cookie_is_script_readable() {
        let config = CsrfConfig::default();
        let cookie = config
            .cookie
            .build_cookie("tok", config.token_ttl)
            .to_string();
        assert!(cookie.starts_with("_csrf=tok"));
        assert!(!cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
    }

    #[test]
    fn test_config_error_names_field() {
        let mut config = AuthConfig::default();
        config.oidc.issuer = "https://idp.example.com".to_string();
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "config value required: oidc.client_id");

        config.oidc.client_id = "dashboard".to_string();
        config.oidc.redirect_url = "https://app.example.com/cb".to_string();
        config.session.ttl = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "bad config value: session.ttl must be positive");
    }
}
