//! Server-side sessions.
//!
//! Sessions live under the `session:` prefix of a [`RecordStore`]. Expiry
//! only moves forward through [`SessionStore::touch`]; reads never extend
//! it. Token fields in the metadata map are sealed by the optional
//! [`TokenEncryptor`] on write and opened on read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use super::record::{RecordStore, StoredRecord, expiry_after};
use crate::config::SessionConfig;
use crate::error::{AuthError, AuthResult};
use crate::events::{EventQueue, SecurityEvent, emit};
use crate::federation::Identity;
use crate::metrics::{MetricsSink, names};
use crate::tasks::{CleanupHandle, spawn_periodic};
use crate::token::{TokenEncryptor, generate_token};

const PREFIX: &str = "session:";

/// Read-modify-write retries before a write gives up.
const MAX_WRITE_ATTEMPTS: usize = 8;

/// Random bytes in a session id.
pub const SESSION_ID_BYTES: usize = 32;

/// Metadata key holding the provider's session id (`sid` claim).
pub const PROVIDER_SID_KEY: &str = "provider_sid";

/// A server-side session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque, unguessable id; also the cookie value.
    pub id: String,
    /// Subject of the authenticated principal.
    pub user_id: String,
    /// Display name.
    pub username: String,
    /// Email, if known.
    pub email: Option<String>,
    /// Roles at login time.
    pub roles: Vec<String>,
    /// Groups at login time.
    pub groups: Vec<String>,
    /// Provider that authenticated the principal.
    pub provider: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed_at: OffsetDateTime,
    /// Free-form string metadata, e.g. OAuth tokens for refresh and logout.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Session {
    /// New session for `identity` lasting `ttl`, with a fresh random id.
    ///
    /// The provider's `sid` claim, when present, is kept under
    /// [`PROVIDER_SID_KEY`] so back-channel logout can find the session.
    #[must_use]
    pub fn from_identity(identity: &Identity, ttl: Duration) -> Self {
        let now = OffsetDateTime::now_utc();
        let metadata = identity
            .raw_claims
            .get("sid")
            .and_then(|sid| sid.as_str())
            .map(|sid| HashMap::from([(PROVIDER_SID_KEY.to_string(), sid.to_string())]))
            .unwrap_or_default();
        Self {
            id: generate_token(SESSION_ID_BYTES),
            user_id: identity.subject.clone(),
            username: identity.username.clone(),
            email: identity.email.clone(),
            roles: identity.roles.clone(),
            groups: identity.groups.clone(),
            provider: identity.provider.clone(),
            created_at: now,
            expires_at: expiry_after(ttl),
            last_accessed_at: now,
            metadata,
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns `true` once `expires_at` has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at <= OffsetDateTime::now_utc()
    }
}

/// Session store over a [`RecordStore`].
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn RecordStore>,
    config: SessionConfig,
    encryptor: Arc<TokenEncryptor>,
    metrics: Arc<dyn MetricsSink>,
    events: Option<EventQueue>,
}

impl SessionStore {
    /// Creates a store without token encryption.
    pub fn new(
        store: Arc<dyn RecordStore>,
        config: SessionConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            config,
            encryptor: Arc::new(TokenEncryptor::disabled()),
            metrics,
            events: None,
        }
    }

    /// Seals token metadata with `encryptor`.
    #[must_use]
    pub fn with_encryptor(mut self, encryptor: Arc<TokenEncryptor>) -> Self {
        self.encryptor = encryptor;
        self
    }

    /// Sends revocations to `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventQueue) -> Self {
        self.events = Some(events);
        self
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn key(id: &str) -> String {
        format!("{PREFIX}{id}")
    }

    fn seal(&self, session: &Session) -> AuthResult<StoredRecord> {
        let mut sealed = session.clone();
        sealed.metadata = self.encryptor.encrypt_metadata(&session.metadata)?;
        StoredRecord::encode(&sealed, sealed.expires_at)
    }

    fn open(&self, record: &StoredRecord) -> AuthResult<Session> {
        let mut session: Session = record.decode()?;
        session.metadata = self.encryptor.decrypt_metadata(&session.metadata)?;
        Ok(session)
    }

    /// Persists a new session.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if the id is already taken and
    /// `AuthError::Storage` or `AuthError::Crypto` on backend or sealing
    /// failures.
    pub async fn create(&self, session: &Session) -> AuthResult<()> {
        let record = self.seal(session)?;
        if !self.store.put_if_absent(&Self::key(&session.id), record).await? {
            return Err(AuthError::internal("session id collision"));
        }
        self.metrics.increment_counter(
            names::SESSIONS_CREATED_TOTAL,
            &[("provider", session.provider.as_str())],
        );
        tracing::debug!(user_id = %session.user_id, provider = %session.provider, "session created");
        Ok(())
    }

    /// Creates a session for `identity` using the configured TTL.
    ///
    /// # Errors
    ///
    /// See [`create`](Self::create).
    pub async fn create_for(&self, identity: &Identity) -> AuthResult<Session> {
        let session = Session::from_identity(identity, self.config.ttl);
        self.create(&session).await?;
        Ok(session)
    }

    /// Loads a session.
    ///
    /// # Errors
    ///
    /// - `AuthError::NotFound` if no session has this id
    /// - `AuthError::Expired` if it exists but is past `expires_at`
    pub async fn get(&self, id: &str) -> AuthResult<Session> {
        let record = self
            .store
            .get(&Self::key(id))
            .await?
            .ok_or_else(|| AuthError::not_found("session"))?;
        if record.is_expired() {
            return Err(AuthError::expired("session"));
        }
        self.open(&record)
    }

    /// Overwrites an existing session's attributes and metadata.
    ///
    /// `created_at` and `expires_at` come from the stored record, never from
    /// `session`: a copy read before a [`touch`](Self::touch) cannot pull
    /// the expiry back. `last_accessed_at` only moves forward.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::NotFound` if the session does not exist.
    pub async fn update(&self, session: &Session) -> AuthResult<()> {
        let key = Self::key(&session.id);
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| AuthError::not_found("session"))?;
            let stored: Session = current.decode()?;

            let mut next = session.clone();
            next.created_at = stored.created_at;
            next.expires_at = stored.expires_at;
            next.last_accessed_at = stored.last_accessed_at.max(session.last_accessed_at);

            let record = self.seal(&next)?;
            if self.store.replace_if_unchanged(&key, &current, record).await? {
                return Ok(());
            }
        }
        tracing::warn!(user_id = %session.user_id, "session update lost to concurrent writers");
        Err(AuthError::storage("session update contention"))
    }

    /// Deletes a session. Deleting a missing session is not an error.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the backend fails.
    pub async fn delete(&self, id: &str) -> AuthResult<()> {
        if self.store.delete(&Self::key(id)).await? {
            self.metrics.increment_counter(names::SESSIONS_REVOKED_TOTAL, &[]);
        }
        Ok(())
    }

    /// Raw records of every session belonging to `user_id`.
    async fn records_for(&self, user_id: &str) -> AuthResult<Vec<(String, StoredRecord)>> {
        let mut matches = Vec::new();
        for (key, record) in self.store.scan_prefix(PREFIX).await? {
            match record.value.get("user_id").and_then(|v| v.as_str()) {
                Some(owner) if owner == user_id => matches.push((key, record)),
                Some(_) => {}
                None => tracing::warn!(key = %key, "skipping malformed session record"),
            }
        }
        Ok(matches)
    }

    /// Revokes every session of `user_id`, expired ones included. Returns
    /// how many were deleted.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the backend fails.
    pub async fn delete_by_user_id(&self, user_id: &str) -> AuthResult<usize> {
        let mut deleted = 0;
        for (key, _) in self.records_for(user_id).await? {
            if self.store.delete(&key).await? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            self.metrics
                .add_counter(names::SESSIONS_REVOKED_TOTAL, &[], deleted as u64);
            tracing::info!(user_id = %user_id, count = deleted, "revoked user sessions");
            emit(
                self.events.as_ref(),
                SecurityEvent::SessionRevoked {
                    user_id: user_id.to_string(),
                    count: deleted,
                    reason: "logout_all".to_string(),
                },
            );
        }
        Ok(deleted)
    }

    /// Live sessions of `user_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` or `AuthError::Crypto` on failure.
    pub async fn get_by_user_id(&self, user_id: &str) -> AuthResult<Vec<Session>> {
        let mut sessions = Vec::new();
        for (_, record) in self.records_for(user_id).await? {
            if !record.is_expired() {
                sessions.push(self.open(&record)?);
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    /// Extends a session to `new_expiry` and bumps `last_accessed_at`.
    ///
    /// Expiry never moves backwards: an earlier `new_expiry` keeps the
    /// current one.
    ///
    /// # Errors
    ///
    /// - `AuthError::NotFound` if the session does not exist
    /// - `AuthError::Expired` if it already expired; expired sessions cannot
    ///   be revived
    pub async fn touch(&self, id: &str, new_expiry: OffsetDateTime) -> AuthResult<Session> {
        let key = Self::key(id);
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| AuthError::not_found("session"))?;
            if current.is_expired() {
                return Err(AuthError::expired("session"));
            }

            // Only the timestamps change; sealed metadata is carried as is.
            let mut stored: Session = current.decode()?;
            stored.expires_at = current.expires_at.max(new_expiry);
            stored.last_accessed_at = OffsetDateTime::now_utc();
            let record = StoredRecord::encode(&stored, stored.expires_at)?;

            if self
                .store
                .replace_if_unchanged(&key, &current, record.clone())
                .await?
            {
                return self.open(&record);
            }
        }
        tracing::warn!(session = %id, "session touch lost to concurrent writers");
        Err(AuthError::storage("session touch contention"))
    }

    /// Resolves the session behind a request.
    ///
    /// With sliding renewal enabled the session is touched to `now + ttl`.
    /// A failed touch is logged and the request proceeds, unless
    /// `fail_closed_on_touch_error` is set.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`get`](Self::get), and of
    /// [`touch`](Self::touch) when failing closed.
    pub async fn authenticate(&self, id: &str) -> AuthResult<Session> {
        let session = self.get(id).await?;
        if !self.config.sliding_renewal {
            return Ok(session);
        }

        match self.touch(id, expiry_after(self.config.ttl)).await {
            Ok(renewed) => Ok(renewed),
            Err(e) if self.config.fail_closed_on_touch_error => Err(e),
            Err(e) => {
                tracing::warn!(user_id = %session.user_id, error = %e, "session renewal failed, proceeding");
                Ok(session)
            }
        }
    }

    /// Replaces `old_id` with `new_session` after a privilege change.
    ///
    /// Deleting the old session is best-effort.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`create`](Self::create).
    pub async fn rotate(&self, old_id: &str, new_session: Session) -> AuthResult<Session> {
        if let Err(e) = self.store.delete(&Self::key(old_id)).await {
            tracing::warn!(error = %e, "failed to delete previous session during rotation");
        }
        self.create(&new_session).await?;
        Ok(new_session)
    }

    /// Number of live sessions.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the backend fails.
    pub async fn count(&self) -> AuthResult<usize> {
        self.store.count_prefix(PREFIX).await
    }

    /// Removes expired sessions. Returns how many were removed.
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
        spawn_periodic("session_cleanup", interval, token, move || {
            let this = this.clone();
            async move { this.cleanup_expired().await }
        })
    }
}
