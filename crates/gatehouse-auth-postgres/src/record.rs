//! [`RecordStore`] over a single `auth_records` table.
//!
//! Atomicity comes from single statements: `put_if_absent` is an upsert
//! guarded on expiry and `take` is `DELETE ... RETURNING`.

use std::sync::Arc;

use async_trait::async_trait;
use gatehouse_auth::AuthResult;
use gatehouse_auth::storage::{RecordStore, StoredRecord};
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_core::query_scalar::query_scalar;
use time::OffsetDateTime;

use crate::{PgPool, StorageError, StorageResult};

type RecordRow = (serde_json::Value, OffsetDateTime);

/// PostgreSQL-backed record store.
#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: Arc<PgPool>,
}

impl PostgresRecordStore {
    /// Creates a store over an existing pool.
    #[must_use]
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Connects and applies migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or a migration fails.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        use sqlx_core::pool::PoolOptions;
        use sqlx_postgres::Postgres;

        let pool = PoolOptions::<Postgres>::new().connect(database_url).await?;
        crate::migrations::run(&pool).await?;
        Ok(Self::new(Arc::new(pool)))
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_count(count: i64) -> StorageResult<usize> {
    usize::try_from(count).map_err(|_| StorageError::InvalidCount(count))
}

fn into_record((value, expires_at): RecordRow) -> StoredRecord {
    StoredRecord::new(value, expires_at)
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn put(&self, key: &str, record: StoredRecord) -> AuthResult<()> {
        query(
            r#"
            INSERT INTO auth_records (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
                SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(&record.value)
        .bind(record.expires_at)
        .execute(self.pool.as_ref())
        .await
        .map_err(StorageError::from)?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, record: StoredRecord) -> AuthResult<bool> {
        let inserted: Option<String> = query_scalar(
            r#"
            INSERT INTO auth_records (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
                SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
                WHERE auth_records.expires_at <= NOW()
            RETURNING key
            "#,
        )
        .bind(key)
        .bind(&record.value)
        .bind(record.expires_at)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(StorageError::from)?;
        Ok(inserted.is_some())
    }

    async fn get(&self, key: &str) -> AuthResult<Option<StoredRecord>> {
        let row: Option<RecordRow> =
            query_as("SELECT value, expires_at FROM auth_records WHERE key = $1")
                .bind(key)
                .fetch_optional(self.pool.as_ref())
                .await
                .map_err(StorageError::from)?;
        Ok(row.map(into_record))
    }

    async fn take(&self, key: &str) -> AuthResult<Option<StoredRecord>> {
        let row: Option<RecordRow> =
            query_as("DELETE FROM auth_records WHERE key = $1 RETURNING value, expires_at")
                .bind(key)
                .fetch_optional(self.pool.as_ref())
                .await
                .map_err(StorageError::from)?;
        Ok(row.map(into_record))
    }

    async fn replace(&self, key: &str, record: StoredRecord) -> AuthResult<bool> {
        let result = query("UPDATE auth_records SET value = $2, expires_at = $3 WHERE key = $1")
            .bind(key)
            .bind(&record.value)
            .bind(record.expires_at)
            .execute(self.pool.as_ref())
            .await
            .map_err(StorageError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn replace_if_unchanged(
        &self,
        key: &str,
        current: &StoredRecord,
        record: StoredRecord,
    ) -> AuthResult<bool> {
        let result = query(
            r#"
            UPDATE auth_records SET value = $4, expires_at = $5
            WHERE key = $1 AND value = $2 AND expires_at = $3
            "#,
        )
        .bind(key)
        .bind(&current.value)
        .bind(current.expires_at)
        .bind(&record.value)
        .bind(record.expires_at)
        .execute(self.pool.as_ref())
        .await
        .map_err(StorageError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, key: &str) -> AuthResult<bool> {
        let result = query("DELETE FROM auth_records WHERE key = $1")
            .bind(key)
            .execute(self.pool.as_ref())
            .await
            .map_err(StorageError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> AuthResult<Vec<(String, StoredRecord)>> {
        let rows: Vec<(String, serde_json::Value, OffsetDateTime)> = query_as(
            "SELECT key, value, expires_at FROM auth_records WHERE starts_with(key, $1) ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(StorageError::from)?;
        Ok(rows
            .into_iter()
            .map(|(key, value, expires_at)| (key, StoredRecord::new(value, expires_at)))
            .collect())
    }

    async fn purge_expired(&self, prefix: &str) -> AuthResult<usize> {
        let result = query(
            "DELETE FROM auth_records WHERE starts_with(key, $1) AND expires_at <= NOW()",
        )
        .bind(prefix)
        .execute(self.pool.as_ref())
        .await
        .map_err(StorageError::from)?;
        let purged = result.rows_affected() as usize;
        if purged > 0 {
            tracing::debug!(prefix, purged, "purged expired auth records");
        }
        Ok(purged)
    }

    async fn count_prefix(&self, prefix: &str) -> AuthResult<usize> {
        let count: i64 = query_scalar(
            "SELECT COUNT(*) FROM auth_records WHERE starts_with(key, $1) AND expires_at > NOW()",
        )
        .bind(prefix)
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(StorageError::from)?;
        Ok(row_count(count)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use gatehouse_auth::config::SessionConfig;
    use gatehouse_auth::federation::{AuthMethod, Identity};
    use gatehouse_auth::storage::{SessionStore, StateStore, conformance};

    #[test]
    fn test_row_count_rejects_negative() {
        assert_eq!(row_count(3).unwrap(), 3);
        let err = row_count(-1).unwrap_err();
        assert!(matches!(err, StorageError::InvalidCount(-1)));
        let err: gatehouse_auth::AuthError = err.into();
        assert!(matches!(err, gatehouse_auth::AuthError::Storage { .. }));
    }

    async fn store() -> Option<PostgresRecordStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        Some(PostgresRecordStore::connect(&url).await.unwrap())
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_conformance() {
        let Some(store) = store().await else { return };
        conformance::run_all(Arc::new(store)).await;
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_state_is_single_use() {
        let Some(store) = store().await else { return };
        let states = StateStore::new(Arc::new(store), Duration::from_secs(60));
        let (key, _) = states.create(None, Some("n".into()), "/").await.unwrap();

        assert_eq!(states.take(&key).await.unwrap().nonce.as_deref(), Some("n"));
        assert!(states.take(&key).await.unwrap_err().is_absent());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_sessions_survive_reconnect() {
        let Some(store) = store().await else { return };
        crate::migrations::run(store.pool()).await.unwrap();

        let sessions = SessionStore::new(
            Arc::new(store.clone()),
            SessionConfig::default(),
            gatehouse_auth::metrics::noop(),
        );
        let subject = format!("pg-user-{}", gatehouse_auth::token::generate_token(4));
        let identity = Identity {
            subject: subject.clone(),
            username: "pg".into(),
            email: None,
            email_verified: false,
            roles: vec!["viewer".into()],
            groups: Vec::new(),
            issuer: "https://idp.example.com".into(),
            provider: "oidc".into(),
            auth_method: AuthMethod::Oidc,
            issued_at: None,
            expires_at: None,
            raw_claims: serde_json::Map::new(),
        };
        let session = sessions.create_for(&identity).await.unwrap();

        let reopened = SessionStore::new(
            Arc::new(PostgresRecordStore::new(Arc::new(store.pool().clone()))),
            SessionConfig::default(),
            gatehouse_auth::metrics::noop(),
        );
        assert_eq!(reopened.get(&session.id).await.unwrap().user_id, subject);
        assert_eq!(reopened.delete_by_user_id(&subject).await.unwrap(), 1);
    }
}
