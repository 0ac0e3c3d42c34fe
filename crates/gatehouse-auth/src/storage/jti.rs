//! Replay-prevention ledger for single-use tokens.
//!
//! Back-channel logout tokens carry a `jti`. The first sighting is recorded
//! with an expiry matching the token's own lifetime; any second sighting
//! while that record is live is a replay, whatever the rest of the token
//! says.
//!
//! # Security Considerations
//!
//! - The check and the insert are one atomic backend operation
//! - A rejected replay never overwrites the original `first_seen`
//! - Expired records may be replaced silently; the token itself is no
//!   longer valid by then

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use super::record::{RecordStore, StoredRecord, expiry_after};
use crate::error::{AuthError, AuthResult};
use crate::events::{EventQueue, SecurityEvent, emit};
use crate::metrics::{MetricsSink, names};
use crate::tasks::{CleanupHandle, spawn_periodic};

const PREFIX: &str = "jti:";

/// A recorded token sighting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JtiEntry {
    /// Token identifier.
    pub jti: String,
    /// Token issuer.
    pub issuer: String,
    /// Token subject, if any.
    pub subject: Option<String>,
    /// Session the token targets, if any.
    pub session_id: Option<String>,
    /// Address the token arrived from.
    pub source_addr: Option<String>,
    /// First time the token was seen. Set by the tracker.
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    /// When the record may be forgotten. Set by the tracker.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl JtiEntry {
    /// Creates an entry for `jti` from `issuer`; timestamps are filled in by
    /// [`JtiTracker::check_and_store`].
    #[must_use]
    pub fn new(jti: impl Into<String>, issuer: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            jti: jti.into(),
            issuer: issuer.into(),
            subject: None,
            session_id: None,
            source_addr: None,
            first_seen: now,
            expires_at: now,
        }
    }

    /// Sets the subject.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Sets the session id.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Sets the source address.
    #[must_use]
    pub fn with_source_addr(mut self, addr: impl Into<String>) -> Self {
        self.source_addr = Some(addr.into());
        self
    }
}

/// Replay tracker over a [`RecordStore`].
#[derive(Clone)]
pub struct JtiTracker {
    store: Arc<dyn RecordStore>,
    metrics: Arc<dyn MetricsSink>,
    events: Option<EventQueue>,
}

impl JtiTracker {
    /// Creates a tracker.
    pub fn new(store: Arc<dyn RecordStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            store,
            metrics,
            events: None,
        }
    }

    /// Sends replay detections to `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventQueue) -> Self {
        self.events = Some(events);
        self
    }

    /// Records the first sighting of `entry.jti`, or rejects a replay.
    ///
    /// # Arguments
    ///
    /// * `entry` - Token metadata; `first_seen`/`expires_at` are overwritten
    /// * `ttl` - How long the token stays valid, usually `exp - now`
    ///
    /// # Errors
    ///
    /// - `AuthError::ReplayDetected` if a live record for the same id exists
    /// - `AuthError::Storage` if the backend fails
    pub async fn check_and_store(&self, mut entry: JtiEntry, ttl: Duration) -> AuthResult<()> {
        entry.first_seen = OffsetDateTime::now_utc();
        entry.expires_at = expiry_after(ttl);

        let record = StoredRecord::encode(&entry, entry.expires_at)?;
        let inserted = self
            .store
            .put_if_absent(&format!("{PREFIX}{}", entry.jti), record)
            .await?;

        if !inserted {
            self.metrics
                .increment_counter(names::JTI_REPLAY_ATTEMPTS_TOTAL, &[]);
            tracing::warn!(
                jti = %entry.jti,
                issuer = %entry.issuer,
                source_addr = entry.source_addr.as_deref().unwrap_or("-"),
                "token replay detected"
            );
            emit(
                self.events.as_ref(),
                SecurityEvent::ReplayDetected {
                    jti: entry.jti.clone(),
                    issuer: entry.issuer.clone(),
                    source_addr: entry.source_addr.clone(),
                },
            );
            return Err(AuthError::replay_detected(format!("jti {}", entry.jti)));
        }

        self.metrics.increment_counter(names::JTI_STORED_TOTAL, &[]);
        tracing::debug!(jti = %entry.jti, "recorded token id");
        Ok(())
    }

    /// Returns `true` if a live record exists for `jti`. Never mutates.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the backend fails.
    pub async fn is_used(&self, jti: &str) -> AuthResult<bool> {
        Ok(self
            .store
            .get(&format!("{PREFIX}{jti}"))
            .await?
            .is_some_and(|record| !record.is_expired()))
    }

    /// Returns the live record for `jti`, if any.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the backend fails or the record is
    /// malformed.
    pub async fn get(&self, jti: &str) -> AuthResult<Option<JtiEntry>> {
        match self.store.get(&format!("{PREFIX}{jti}")).await? {
            Some(record) if !record.is_expired() => record.decode().map(Some),
            _ => Ok(None),
        }
    }

    /// Removes expired records. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the backend fails.
    pub async fn cleanup_expired(&self) -> AuthResult<usize> {
        let removed = self.store.purge_expired(PREFIX).await?;
        if let Ok(size) = self.size().await {
            self.metrics.set_gauge(names::JTI_ENTRIES, &[], size as f64);
        }
        Ok(removed)
    }

    /// Number of live records.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the backend fails.
    pub async fn size(&self) -> AuthResult<usize> {
        self.store.count_prefix(PREFIX).await
    }

    /// Starts a periodic sweep.
    pub fn start_cleanup(&self, interval: Duration, token: CancellationToken) -> CleanupHandle {
        let this = self.clone();
        spawn_periodic("jti_cleanup", interval, token, move || {
            let this = this.clone();
            async move { this.cleanup_expired().await }
        })
    }
}
