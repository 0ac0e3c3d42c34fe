//! Generic TTL-keyed record storage.
//!
//! Every entity store (authorization state, sessions, JTI ledger, CSRF
//! ledger, lockout entries) is a thin typed layer over [`RecordStore`] with
//! its own key prefix. Backends implement the trait once and gain all of
//! them.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;

use crate::error::{AuthError, AuthResult};

/// A stored value and its expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// JSON payload.
    pub value: serde_json::Value,
    /// Instant after which the record counts as expired.
    pub expires_at: OffsetDateTime,
}

impl StoredRecord {
    /// Creates a record.
    #[must_use]
    pub fn new(value: serde_json::Value, expires_at: OffsetDateTime) -> Self {
        Self { value, expires_at }
    }

    /// Serializes `value` into a record.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if serialization fails.
    pub fn encode<T: Serialize>(value: &T, expires_at: OffsetDateTime) -> AuthResult<Self> {
        let value = serde_json::to_value(value)
            .map_err(|e| AuthError::internal(format!("failed to encode record: {e}")))?;
        Ok(Self { value, expires_at })
    }

    /// Deserializes the payload.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the stored JSON has the wrong shape.
    pub fn decode<T: DeserializeOwned>(&self) -> AuthResult<T> {
        serde_json::from_value(self.value.clone())
            .map_err(|e| AuthError::storage(format!("failed to decode record: {e}")))
    }

    /// Returns `true` if the record is expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }

    /// Returns `true` if the record is expired now.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }
}

/// Key-value storage with per-record expiry.
///
/// Expired records stay readable through [`get`](Self::get) and
/// [`scan_prefix`](Self::scan_prefix) until purged, so callers can tell
/// "expired" from "not found". Every write is atomic with respect to other
/// writes on the same key.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts or overwrites a record.
    async fn put(&self, key: &str, record: StoredRecord) -> AuthResult<()>;

    /// Inserts only if no live record exists under `key`.
    ///
    /// An expired record is replaced. Returns `false`, leaving the existing
    /// record untouched, when a live one is present.
    async fn put_if_absent(&self, key: &str, record: StoredRecord) -> AuthResult<bool>;

    /// Reads a record, expired or not.
    async fn get(&self, key: &str) -> AuthResult<Option<StoredRecord>>;

    /// Atomically reads and deletes a record, expired or not.
    async fn take(&self, key: &str) -> AuthResult<Option<StoredRecord>>;

    /// Overwrites a record only if one exists. Returns whether it did.
    async fn replace(&self, key: &str, record: StoredRecord) -> AuthResult<bool>;

    /// Overwrites the record under `key` only if it still equals `current`.
    ///
    /// Returns `false`, writing nothing, when the record changed or is gone
    /// since `current` was read. Read-modify-write callers retry on `false`.
    async fn replace_if_unchanged(
        &self,
        key: &str,
        current: &StoredRecord,
        record: StoredRecord,
    ) -> AuthResult<bool>;

    /// Deletes a record. Returns whether something was removed.
    async fn delete(&self, key: &str) -> AuthResult<bool>;

    /// Lists every record whose key starts with `prefix`, expired or not.
    async fn scan_prefix(&self, prefix: &str) -> AuthResult<Vec<(String, StoredRecord)>>;

    /// Deletes expired records under `prefix`. Returns how many went.
    async fn purge_expired(&self, prefix: &str) -> AuthResult<usize>;

    /// Counts live records under `prefix`.
    async fn count_prefix(&self, prefix: &str) -> AuthResult<usize>;
}

/// `OffsetDateTime::now_utc() + ttl`, saturating at the far future.
#[must_use]
pub fn expiry_after(ttl: std::time::Duration) -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.checked_add(time::Duration::try_from(ttl).unwrap_or(time::Duration::MAX))
        .unwrap_or(now + time::Duration::days(365 * 100))
}

/// Remaining time until `at`, or zero when it has passed.
#[must_use]
pub fn remaining_until(at: OffsetDateTime) -> std::time::Duration {
    std::time::Duration::try_from(at - OffsetDateTime::now_utc()).unwrap_or_default()
}
