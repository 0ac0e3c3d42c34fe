//! CSRF double-submit guard.
//!
//! Safe methods are handed a random token in a script-readable cookie.
//! Unsafe methods must send the same token back in a header or form field;
//! the two are compared in constant time, then the token is looked up in a
//! server-side ledger so a cookie planted by an attacker is not enough on
//! its own.
//!
//! The guard does not depend on sessions, so it also protects the login
//! form itself.

use std::sync::Arc;
use std::time::Duration;

use cookie::Cookie;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::config::CsrfConfig;
use crate::error::{AuthError, AuthResult};
use crate::http::SecurityRequest;
use crate::metrics::{MetricsSink, names};
use crate::storage::{RecordStore, StoredRecord, expiry_after};
use crate::tasks::{CleanupHandle, spawn_periodic};
use crate::token::generate_token;

const PREFIX: &str = "csrf:";

/// Why a request failed the CSRF check.
#[derive(Debug, thiserror::Error)]
pub enum CsrfError {
    /// No cookie, or nothing resubmitted.
    #[error("CSRF token missing")]
    Missing,

    /// Cookie and resubmitted token differ, or the ledger never issued it.
    #[error("CSRF token invalid")]
    Invalid,

    /// The ledger entry is past its TTL.
    #[error("CSRF token expired")]
    Expired,

    /// The ledger could not be consulted.
    #[error("CSRF ledger unavailable: {0}")]
    Ledger(#[source] AuthError),
}

impl CsrfError {
    /// Label for the `reason` metric dimension.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Invalid => "invalid",
            Self::Expired => "expired",
            Self::Ledger(_) => "ledger_error",
        }
    }
}

impl From<CsrfError> for AuthError {
    fn from(err: CsrfError) -> Self {
        match err {
            CsrfError::Ledger(inner) => inner,
            other => AuthError::forbidden(other.to_string()),
        }
    }
}

/// Result of running the guard on a request.
#[derive(Debug, Clone, PartialEq)]
pub enum CsrfOutcome {
    /// The guard is off or the path is exempt.
    Exempt,
    /// Safe method; the client already holds a valid token.
    Valid {
        /// Current token.
        token: String,
    },
    /// Safe method; a new token was issued and must be set on the response.
    Issued {
        /// New token.
        token: String,
        /// Cookie carrying the token.
        set_cookie: Cookie<'static>,
    },
    /// Unsafe method with a matching, ledger-known token.
    Verified,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerEntry {
    #[serde(with = "time::serde::rfc3339")]
    issued_at: OffsetDateTime,
}

/// Double-submit CSRF guard.
#[derive(Clone)]
pub struct CsrfGuard {
    config: CsrfConfig,
    store: Arc<dyn RecordStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl CsrfGuard {
    /// Creates a guard over `store`.
    pub fn new(
        config: CsrfConfig,
        store: Arc<dyn RecordStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            store,
            metrics,
        }
    }

    /// Guard configuration.
    #[must_use]
    pub fn config(&self) -> &CsrfConfig {
        &self.config
    }

    fn is_exempt_path(&self, path: &str) -> bool {
        self.config
            .exempt_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    fn is_safe_method(&self, method: &str) -> bool {
        self.config
            .exempt_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
    }

    /// Runs the guard.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Forbidden` when an unsafe request fails
    /// validation and `AuthError::Storage` when the ledger is unreachable.
    pub async fn check(&self, req: &impl SecurityRequest) -> AuthResult<CsrfOutcome> {
        if !self.config.enabled || self.is_exempt_path(req.path()) {
            return Ok(CsrfOutcome::Exempt);
        }

        if self.is_safe_method(req.method().as_str()) {
            return self.token_for(req).await;
        }

        match self.validate(req).await {
            Ok(()) => Ok(CsrfOutcome::Verified),
            Err(e) => {
                self.metrics
                    .increment_counter(names::CSRF_REJECTIONS_TOTAL, &[("reason", e.reason())]);
                tracing::warn!(
                    method = %req.method(),
                    path = %req.path(),
                    reason = e.reason(),
                    "CSRF check failed"
                );
                Err(e.into())
            }
        }
    }

    /// Checks that the resubmitted token matches the cookie and is known to
    /// the ledger.
    ///
    /// # Errors
    ///
    /// Returns the specific `CsrfError`.
    pub async fn validate(&self, req: &impl SecurityRequest) -> Result<(), CsrfError> {
        let cookie_token = req
            .cookie(&self.config.cookie.name)
            .filter(|t| !t.is_empty())
            .ok_or(CsrfError::Missing)?;
        let submitted = req
            .header(&self.config.header_name)
            .or_else(|| req.form_value(&self.config.form_field))
            .filter(|t| !t.is_empty())
            .ok_or(CsrfError::Missing)?;

        if !bool::from(cookie_token.as_bytes().ct_eq(submitted.as_bytes())) {
            return Err(CsrfError::Invalid);
        }

        match self
            .store
            .get(&format!("{PREFIX}{cookie_token}"))
            .await
            .map_err(CsrfError::Ledger)?
        {
            None => Err(CsrfError::Invalid),
            Some(record) if record.is_expired() => Err(CsrfError::Expired),
            Some(_) => Ok(()),
        }
    }

    /// Returns the client's current valid token, or issues a new one.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the ledger is unreachable.
    pub async fn token_for(&self, req: &impl SecurityRequest) -> AuthResult<CsrfOutcome> {
        if let Some(existing) = req.cookie(&self.config.cookie.name).filter(|t| !t.is_empty()) {
            let live = self
                .store
                .get(&format!("{PREFIX}{existing}"))
                .await?
                .is_some_and(|record| !record.is_expired());
            if live {
                return Ok(CsrfOutcome::Valid {
                    token: existing.to_string(),
                });
            }
        }

        let token = self.issue().await?;
        let set_cookie = self
            .config
            .cookie
            .build_cookie(token.clone(), self.config.token_ttl);
        Ok(CsrfOutcome::Issued { token, set_cookie })
    }

    /// Records a fresh token in the ledger and returns it.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the ledger write fails.
    pub async fn issue(&self) -> AuthResult<String> {
        let token = generate_token(self.config.token_length);
        let entry = LedgerEntry {
            issued_at: OffsetDateTime::now_utc(),
        };
        let record = StoredRecord::encode(&entry, expiry_after(self.config.token_ttl))?;
        self.store.put(&format!("{PREFIX}{token}"), record).await?;
        Ok(token)
    }

    /// Removes expired ledger entries. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the backend fails.
    pub async fn cleanup_expired(&self) -> AuthResult<usize> {
        self.store.purge_expired(PREFIX).await
    }

    /// Starts a periodic ledger sweep.
    pub fn start_cleanup(&self, interval: Duration, token: CancellationToken) -> CleanupHandle {
        let this = self.clone();
        spawn_periodic("csrf_cleanup", interval, token, move || {
            let this = this.clone();
            async move { this.cleanup_expired().await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RequestSnapshot;
    use crate::metrics::RecordingMetrics;
    use crate::storage::MemoryRecordStore;
    use axum::http::Method;
    use std::collections::HashMap;

    fn guard_with(config: CsrfConfig) -> (CsrfGuard, Arc<RecordingMetrics>) {
        let metrics = Arc::new(RecordingMetrics::new());
        (
            CsrfGuard::new(config, Arc::new(MemoryRecordStore::new()), metrics.clone()),
            metrics,
        )
    }

    fn guard() -> (CsrfGuard, Arc<RecordingMetrics>) {
        guard_with(CsrfConfig::default())
    }

    async fn issued_token(guard: &CsrfGuard) -> String {
        match guard
            .check(&RequestSnapshot::new(Method::GET, "/form"))
            .await
            .unwrap()
        {
            CsrfOutcome::Issued { token, set_cookie } => {
                assert_eq!(set_cookie.name(), "_csrf");
                assert_eq!(set_cookie.value(), token);
                token
            }
            other => panic!("expected Issued, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_safe_method_issues_token() {
        let (guard, _) = guard();
        let token = issued_token(&guard).await;
        assert_eq!(token.len(), 43);

        // Presenting the cookie again reuses the token.
        let req = RequestSnapshot::new(Method::GET, "/form").with_cookie("_csrf", token.clone());
        assert_eq!(
            guard.check(&req).await.unwrap(),
            CsrfOutcome::Valid { token }
        );
    }

    #[tokio::test]
    async fn test_header_resubmission_verified() {
        let (guard, metrics) = guard();
        let token = issued_token(&guard).await;

        let req = RequestSnapshot::new(Method::POST, "/items")
            .with_cookie("_csrf", token.clone())
            .with_header("X-CSRF-Token", &token);
        assert_eq!(guard.check(&req).await.unwrap(), CsrfOutcome::Verified);
        assert_eq!(metrics.counter(names::CSRF_REJECTIONS_TOTAL), 0);
    }

    #[tokio::test]
    async fn test_form_resubmission_verified() {
        let (guard, _) = guard();
        let token = issued_token(&guard).await;

        let mut form = HashMap::new();
        form.insert("csrf_token".to_string(), token.clone());
        let req = RequestSnapshot::new(Method::DELETE, "/items/1")
            .with_cookie("_csrf", token)
            .with_form(form);
        assert_eq!(guard.check(&req).await.unwrap(), CsrfOutcome::Verified);
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let (guard, metrics) = guard();
        let token = issued_token(&guard).await;

        let no_header = RequestSnapshot::new(Method::POST, "/items").with_cookie("_csrf", token.clone());
        let err = guard.check(&no_header).await.unwrap_err();
        assert!(matches!(err, AuthError::Forbidden { .. }));

        let no_cookie = RequestSnapshot::new(Method::POST, "/items").with_header("X-CSRF-Token", &token);
        assert!(guard.check(&no_cookie).await.is_err());

        assert_eq!(
            metrics.counter_with(names::CSRF_REJECTIONS_TOTAL, &[("reason", "missing")]),
            2
        );
    }

    #[tokio::test]
    async fn test_mismatch_rejected() {
        let (guard, metrics) = guard();
        let token = issued_token(&guard).await;
        let req = RequestSnapshot::new(Method::POST, "/items")
            .with_cookie("_csrf", token)
            .with_header("X-CSRF-Token", "something-else");

        assert!(matches!(
            guard.validate(&req).await.unwrap_err(),
            CsrfError::Invalid
        ));
        assert!(guard.check(&req).await.is_err());
        assert_eq!(
            metrics.counter_with(names::CSRF_REJECTIONS_TOTAL, &[("reason", "invalid")]),
            1
        );
    }

    #[tokio::test]
    async fn test_cookie_only_forgery_rejected() {
        // Matching cookie and header, but never issued by this server.
        let (guard, _) = guard();
        let forged = generate_token(32);
        let req = RequestSnapshot::new(Method::POST, "/items")
            .with_cookie("_csrf", forged.clone())
            .with_header("X-CSRF-Token", &forged);
        assert!(matches!(
            guard.validate(&req).await.unwrap_err(),
            CsrfError::Invalid
        ));
    }

    #[tokio::test]
    async fn test_expired_ledger_entry_rejected() {
        let config = CsrfConfig {
            token_ttl: Duration::ZERO,
            ..CsrfConfig::default()
        };
        let (guard, _) = guard_with(config);
        let token = guard.issue().await.unwrap();
        let req = RequestSnapshot::new(Method::POST, "/items")
            .with_cookie("_csrf", token.clone())
            .with_header("X-CSRF-Token", &token);
        assert!(matches!(
            guard.validate(&req).await.unwrap_err(),
            CsrfError::Expired
        ));

        assert_eq!(guard.cleanup_expired().await.unwrap(), 1);
        assert!(matches!(
            guard.validate(&req).await.unwrap_err(),
            CsrfError::Invalid
        ));
    }

    #[tokio::test]
    async fn test_exempt_paths_and_disabled() {
        let config = CsrfConfig {
            exempt_paths: vec!["/auth/backchannel".to_string()],
            ..CsrfConfig::default()
        };
        let (guard, _) = guard_with(config);
        let req = RequestSnapshot::new(Method::POST, "/auth/backchannel-logout");
        assert_eq!(guard.check(&req).await.unwrap(), CsrfOutcome::Exempt);

        let config = CsrfConfig {
            enabled: false,
            ..CsrfConfig::default()
        };
        let (guard, _) = guard_with(config);
        let req = RequestSnapshot::new(Method::POST, "/items");
        assert_eq!(guard.check(&req).await.unwrap(), CsrfOutcome::Exempt);
    }

    #[tokio::test]
    async fn test_configured_token_length() {
        let config = CsrfConfig {
            token_length: 16,
            ..CsrfConfig::default()
        };
        let (guard, _) = guard_with(config);
        // 16 bytes -> 22 base64url chars
        assert_eq!(guard.issue().await.unwrap().len(), 22);
    }
}
