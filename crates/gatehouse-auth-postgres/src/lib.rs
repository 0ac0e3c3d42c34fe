//! PostgreSQL backend for gatehouse-auth.
//!
//! Provides [`PostgresRecordStore`], a durable [`RecordStore`] over one
//! `auth_records` table. Every gatehouse-auth store (authorization state,
//! sessions, the JTI ledger, CSRF tokens, lockout entries) works on top of it
//! unchanged.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use gatehouse_auth::storage::SessionStore;
//! use gatehouse_auth_postgres::PostgresRecordStore;
//!
//! let records = Arc::new(PostgresRecordStore::connect("postgres://localhost/app").await?);
//! let sessions = SessionStore::new(records, config.session.clone(), metrics);
//! ```
//!
//! [`RecordStore`]: gatehouse_auth::storage::RecordStore

pub mod migrations;
pub mod record;

use gatehouse_auth::AuthError;
use sqlx_core::pool::Pool;
use sqlx_postgres::Postgres;

/// PostgreSQL connection pool type alias.
pub type PgPool = Pool<Postgres>;

pub use record::PostgresRecordStore;

/// Errors from the PostgreSQL backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx_core::Error),

    /// A schema migration failed.
    #[error("Migration error: {0}")]
    Migration(String),

    /// The database returned a row count that does not fit `usize`.
    #[error("Invalid row count: {0}")]
    InvalidCount(i64),
}

impl StorageError {
    /// Returns `true` if this is a database error.
    #[must_use]
    pub fn is_database_error(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        tracing::warn!(error = %err, "auth record storage failure");
        AuthError::storage(err.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_maps_to_auth_error() {
        let err: AuthError = StorageError::Migration("boom".into()).into();
        assert!(err.is_server_error());
        assert!(!StorageError::Migration("x".into()).is_database_error());
    }
}
