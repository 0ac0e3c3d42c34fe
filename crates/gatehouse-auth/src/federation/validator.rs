//! ID token validation and claim mapping.
//!
//! Checks run in a fixed order: signature, issuer, audience, expiry, then
//! nonce. The first failure wins. Callers only ever see a generic
//! invalid-credentials error; the specific [`TokenValidationError`] is logged
//! at the conversion into [`AuthError`](crate::error::AuthError).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{Algorithm, Validation, decode, decode_header};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use super::error::TokenValidationError;
use super::identity::{AuthMethod, Identity};
use super::jwks::KeyCache;
use crate::config::OidcConfig;
use crate::error::AuthResult;

/// Claims of a verified token, untouched.
pub type Claims = Map<String, Value>;

/// Algorithms accepted for provider tokens.
pub const ACCEPTED_ALGORITHMS: [Algorithm; 3] =
    [Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];

/// Validates provider-signed tokens and maps their claims.
#[derive(Debug, Clone)]
pub struct IdTokenValidator {
    config: Arc<OidcConfig>,
    keys: Arc<KeyCache>,
}

impl IdTokenValidator {
    /// Creates a validator for the provider described by `config`.
    pub fn new(config: Arc<OidcConfig>, keys: Arc<KeyCache>) -> Self {
        Self { config, keys }
    }

    /// Key cache used for signature checks.
    #[must_use]
    pub fn key_cache(&self) -> &Arc<KeyCache> {
        &self.keys
    }

    /// Validates an ID token and returns the identity it asserts.
    ///
    /// `expected_nonce` is the nonce stored with the authorization state;
    /// when given, the token must carry exactly that value.
    ///
    /// # Errors
    ///
    /// - `AuthError::InvalidCredentials` for any validation failure
    /// - `AuthError::Unavailable` if the provider keys cannot be fetched
    pub async fn validate_and_parse(
        &self,
        token: &str,
        expected_nonce: Option<&str>,
    ) -> AuthResult<Identity> {
        let claims = self.validate(token, expected_nonce).await?;
        Ok(self.to_identity(claims))
    }

    /// Full ID token validation, returning the detailed error on failure.
    ///
    /// # Errors
    ///
    /// Returns the first check that failed.
    pub async fn validate(
        &self,
        token: &str,
        expected_nonce: Option<&str>,
    ) -> Result<Claims, TokenValidationError> {
        let claims = self.verify_signed(token).await?;

        if numeric_claim(&claims, "exp").is_none() {
            return Err(TokenValidationError::MissingClaim("exp"));
        }
        if string_claim(&claims, "sub").is_none() {
            return Err(TokenValidationError::MissingClaim("sub"));
        }

        if let Some(expected) = expected_nonce {
            match string_claim(&claims, "nonce") {
                Some(actual) if actual == expected => {}
                Some(_) => return Err(TokenValidationError::NonceMismatch),
                None => return Err(TokenValidationError::MissingClaim("nonce")),
            }
        }

        tracing::debug!(
            subject = string_claim(&claims, "sub").unwrap_or_default(),
            provider = %self.config.provider_name,
            "validated id token"
        );
        Ok(claims)
    }

    /// Signature, issuer, audience and time checks shared by every token
    /// type the provider signs. `exp` is checked only when present.
    ///
    /// # Errors
    ///
    /// Returns the first check that failed.
    pub async fn verify_signed(&self, token: &str) -> Result<Claims, TokenValidationError> {
        let header = decode_header(token).map_err(|e| TokenValidationError::Malformed(e.to_string()))?;
        if !ACCEPTED_ALGORITHMS.contains(&header.alg) {
            return Err(TokenValidationError::UnsupportedAlgorithm(format!(
                "{:?}",
                header.alg
            )));
        }
        let kid = header.kid.ok_or(TokenValidationError::MissingKeyId)?;

        let (key, key_alg) = self.keys.get_key(&kid).await?;
        if let Some(alg) = key_alg
            && alg != header.alg
        {
            return Err(TokenValidationError::Signature(format!(
                "key {kid} is for {alg:?}, token uses {:?}",
                header.alg
            )));
        }

        // Claim checks happen below, in order, with specific errors.
        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let claims = decode::<Claims>(token, &key, &validation)
            .map_err(|e| TokenValidationError::Signature(e.to_string()))?
            .claims;

        self.check_issuer(&claims)?;
        self.check_audience(&claims)?;
        self.check_times(&claims)?;
        Ok(claims)
    }

    fn check_issuer(&self, claims: &Claims) -> Result<(), TokenValidationError> {
        let expected = self.config.issuer.trim_end_matches('/');
        let actual = string_claim(claims, "iss").ok_or(TokenValidationError::MissingClaim("iss"))?;
        if actual.trim_end_matches('/') != expected {
            return Err(TokenValidationError::issuer_mismatch(expected, actual));
        }
        Ok(())
    }

    fn check_audience(&self, claims: &Claims) -> Result<(), TokenValidationError> {
        let client_id = self.config.client_id.as_str();
        let matches = match claims.get("aud") {
            Some(Value::String(aud)) => aud == client_id,
            Some(Value::Array(auds)) => auds.iter().any(|aud| aud.as_str() == Some(client_id)),
            _ => false,
        };
        if !matches {
            return Err(TokenValidationError::AudienceMismatch {
                expected: client_id.to_string(),
                actual: claims.get("aud").map(Value::to_string).unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn check_times(&self, claims: &Claims) -> Result<(), TokenValidationError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let leeway = i64::try_from(self.config.clock_skew.as_secs()).unwrap_or(i64::MAX);

        if let Some(exp) = numeric_claim(claims, "exp")
            && now > exp.saturating_add(leeway)
        {
            return Err(TokenValidationError::Expired);
        }
        if let Some(nbf) = numeric_claim(claims, "nbf")
            && nbf > now.saturating_add(leeway)
        {
            return Err(TokenValidationError::NotYetValid);
        }
        Ok(())
    }

    /// Maps validated claims to an [`Identity`].
    #[must_use]
    pub fn to_identity(&self, claims: Claims) -> Identity {
        let subject = string_claim(&claims, "sub").unwrap_or_default().to_string();

        let username = self
            .config
            .username_claims
            .iter()
            .find_map(|name| string_claim(&claims, name).filter(|v| !v.is_empty()))
            .map_or_else(|| subject.clone(), str::to_string);

        let mut roles = string_list(claims.get(&self.config.roles_claim));
        if roles.is_empty() {
            roles.clone_from(&self.config.default_roles);
        }
        let groups = string_list(claims.get(&self.config.groups_claim));

        let email_verified = match claims.get("email_verified") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        };

        Identity {
            username,
            email: string_claim(&claims, "email").map(str::to_string),
            email_verified,
            roles,
            groups,
            issuer: string_claim(&claims, "iss").unwrap_or_default().to_string(),
            provider: self.config.provider_name.clone(),
            auth_method: AuthMethod::Oidc,
            issued_at: timestamp_claim(&claims, "iat"),
            expires_at: timestamp_claim(&claims, "exp"),
            subject,
            raw_claims: claims,
        }
    }

    /// How long a token with these claims keeps passing validation, clock
    /// skew included. Never shorter than the skew, even for a token already
    /// past `exp`. `None` without an `exp`.
    #[must_use]
    pub fn acceptance_window(&self, claims: &Claims) -> Option<Duration> {
        let exp = numeric_claim(claims, "exp")?;
        let left = exp.saturating_sub(OffsetDateTime::now_utc().unix_timestamp());
        let left = Duration::from_secs(u64::try_from(left).unwrap_or_default());
        Some(left.saturating_add(self.config.clock_skew))
    }
}

pub(crate) fn string_claim<'a>(claims: &'a Claims, name: &str) -> Option<&'a str> {
    claims.get(name).and_then(Value::as_str)
}

fn numeric_claim(claims: &Claims, name: &str) -> Option<i64> {
    match claims.get(name)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

fn timestamp_claim(claims: &Claims, name: &str) -> Option<OffsetDateTime> {
    numeric_claim(claims, name).and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
}

/// Accepts a string array (non-strings dropped) or a single string.
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}
