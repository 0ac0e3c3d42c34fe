//! Pending authorization state.
//!
//! One record per login attempt, keyed by the random `state` parameter sent
//! to the provider. Records are consumed with an atomic take, so a state key
//! validates at most once even under concurrent callbacks.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use super::record::{RecordStore, StoredRecord, expiry_after};
use crate::error::{AuthError, AuthResult};
use crate::tasks::{CleanupHandle, spawn_periodic};
use crate::token::generate_token;

const PREFIX: &str = "state:";

/// Random bytes in a state key (256 bits).
pub const STATE_KEY_BYTES: usize = 32;

/// What the callback needs to finish a login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationState {
    /// PKCE verifier, when PKCE is enabled.
    pub code_verifier: Option<String>,
    /// Nonce expected in the ID token, when nonces are enabled.
    pub nonce: Option<String>,
    /// Where to send the user after login.
    pub post_login_redirect: String,
    /// When the authorization URL was issued.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// When the state stops being accepted.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// Store for [`AuthorizationState`] records.
#[derive(Clone)]
pub struct StateStore {
    store: Arc<dyn RecordStore>,
    ttl: Duration,
}

impl StateStore {
    /// Creates a state store whose records live for `ttl`.
    pub fn new(store: Arc<dyn RecordStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Configured state lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Persists a new state under a fresh random key and returns the key.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the backend write fails.
    pub async fn create(
        &self,
        code_verifier: Option<String>,
        nonce: Option<String>,
        post_login_redirect: impl Into<String>,
    ) -> AuthResult<(String, AuthorizationState)> {
        let key = generate_token(STATE_KEY_BYTES);
        let state = AuthorizationState {
            code_verifier,
            nonce,
            post_login_redirect: post_login_redirect.into(),
            created_at: OffsetDateTime::now_utc(),
            expires_at: expiry_after(self.ttl),
        };
        let record = StoredRecord::encode(&state, state.expires_at)?;
        self.store.put(&format!("{PREFIX}{key}"), record).await?;
        tracing::debug!("stored authorization state");
        Ok((key, state))
    }

    /// Consumes the state under `key`.
    ///
    /// The record is deleted whether or not it was still valid.
    ///
    /// # Errors
    ///
    /// - `AuthError::NotFound` if no record exists (never issued or already used)
    /// - `AuthError::Expired` if the record was past its TTL
    pub async fn take(&self, key: &str) -> AuthResult<AuthorizationState> {
        let record = self
            .store
            .take(&format!("{PREFIX}{key}"))
            .await?
            .ok_or_else(|| AuthError::not_found("authorization state"))?;

        if record.is_expired() {
            return Err(AuthError::expired("authorization state"));
        }
        record.decode()
    }

    /// Number of pending, unexpired login attempts.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the backend fails.
    pub async fn count(&self) -> AuthResult<usize> {
        self.store.count_prefix(PREFIX).await
    }

    /// Removes expired states. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the backend fails.
    pub async fn cleanup_expired(&self) -> AuthResult<usize> {
        self.store.purge_expired(PREFIX).await
    }

    /// Starts a periodic sweep.
    pub fn start_cleanup(&self, interval: Duration, token: CancellationToken) -> CleanupHandle {
        let this = self.clone();
        spawn_periodic("state_cleanup", interval, token, move || {
            let this = this.clone();
            async move { this.cleanup_expired().await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryRecordStore;

    fn state_store(ttl: Duration) -> StateStore {
        StateStore::new(Arc::new(MemoryRecordStore::new()), ttl)
    }

    #[tokio::test]
    async fn test_take_is_single_use() {
        let states = state_store(Duration::from_secs(600));
        let (key, created) = states
            .create(Some("verifier".into()), Some("nonce".into()), "/dashboard")
            .await
            .unwrap();

        assert_eq!(key.len(), 43);
        let taken = states.take(&key).await.unwrap();
        assert_eq!(taken, created);
        assert_eq!(taken.post_login_redirect, "/dashboard");

        let err = states.take(&key).await.unwrap_err();
        assert!(matches!(err, AuthError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let states = state_store(Duration::from_secs(600));
        assert!(matches!(
            states.take("never-issued").await.unwrap_err(),
            AuthError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_expired_state_is_rejected_and_removed() {
        let states = state_store(Duration::ZERO);
        let (key, _) = states.create(None, None, "/").await.unwrap();

        assert!(matches!(
            states.take(&key).await.unwrap_err(),
            AuthError::Expired { .. }
        ));
        assert!(matches!(
            states.take(&key).await.unwrap_err(),
            AuthError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_cleanup_and_count() {
        let backend = Arc::new(MemoryRecordStore::new());
        let expired = StateStore::new(backend.clone(), Duration::ZERO);
        let live = StateStore::new(backend, Duration::from_secs(600));

        expired.create(None, None, "/a").await.unwrap();
        expired.create(None, None, "/b").await.unwrap();
        live.create(None, None, "/c").await.unwrap();

        assert_eq!(live.count().await.unwrap(), 1);
        assert_eq!(live.cleanup_expired().await.unwrap(), 2);
        assert_eq!(live.cleanup_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_take_wins_once() {
        let states = state_store(Duration::from_secs(600));
        let (key, _) = states.create(None, None, "/").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let states = states.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { states.take(&key).await.is_ok() }));
        }
        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }
}
