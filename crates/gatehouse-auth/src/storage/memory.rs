//! In-memory record store.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use super::record::{RecordStore, StoredRecord};
use crate::error::AuthResult;

/// Process-local [`RecordStore`] backed by a `HashMap`.
///
/// Reads share the lock; every mutation, including the check half of a
/// check-then-set, runs under the write lock. Records are cloned on the way
/// in and out so callers never alias stored state.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, StoredRecord>>,
}

impl MemoryRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held, expired ones included.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns `true` if nothing is held.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put(&self, key: &str, record: StoredRecord) -> AuthResult<()> {
        self.records.write().await.insert(key.to_string(), record);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, record: StoredRecord) -> AuthResult<bool> {
        let mut records = self.records.write().await;
        let now = OffsetDateTime::now_utc();
        match records.get(key) {
            Some(existing) if !existing.is_expired_at(now) => Ok(false),
            _ => {
                records.insert(key.to_string(), record);
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> AuthResult<Option<StoredRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn take(&self, key: &str) -> AuthResult<Option<StoredRecord>> {
        Ok(self.records.write().await.remove(key))
    }

    async fn replace(&self, key: &str, record: StoredRecord) -> AuthResult<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(key) {
            Some(slot) => {
                *slot = record;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn replace_if_unchanged(
        &self,
        key: &str,
        current: &StoredRecord,
        record: StoredRecord,
    ) -> AuthResult<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(key) {
            Some(slot) if slot == current => {
                *slot = record;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> AuthResult<bool> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> AuthResult<Vec<(String, StoredRecord)>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect())
    }

    async fn purge_expired(&self, prefix: &str) -> AuthResult<usize> {
        let mut records = self.records.write().await;
        let now = OffsetDateTime::now_utc();
        let before = records.len();
        records.retain(|key, record| !(key.starts_with(prefix) && record.is_expired_at(now)));
        Ok(before - records.len())
    }

    async fn count_prefix(&self, prefix: &str) -> AuthResult<usize> {
        let records = self.records.read().await;
        let now = OffsetDateTime::now_utc();
        Ok(records
            .iter()
            .filter(|(key, record)| key.starts_with(prefix) && !record.is_expired_at(now))
            .count())
    }
}
