//! Error types for the PostgreSQL storage backend.
//!
//! Driver failures are classified onto [`StorageError`] so the registry's
//! retry layer can tell transient outages from conflicts and bugs.

use tessera_storage::{ConfigError, StorageError};
use thiserror::Error;

/// Result type alias for PostgreSQL backend setup.
pub type Result<T> = std::result::Result<T, PostgresStorageError>;

/// SQLSTATE for `serialization_failure`.
const SERIALIZATION_FAILURE: &str = "40001";

/// SQLSTATE for `deadlock_detected`.
const DEADLOCK_DETECTED: &str = "40P01";

/// SQLSTATE for `query_canceled`, raised when `statement_timeout` fires.
const QUERY_CANCELED: &str = "57014";

/// SQLSTATE class for connection exceptions.
const CONNECTION_EXCEPTION_CLASS: &str = "08";

/// Errors raised while constructing or bootstrapping the backend.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PostgresStorageError {
    /// Error from the driver.
    #[error("PostgreSQL error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<PostgresStorageError> for StorageError {
    fn from(err: PostgresStorageError) -> Self {
        match err {
            PostgresStorageError::Sqlx(source) => sqlx_error_to_storage_error(source),
            PostgresStorageError::Config(source) => {
                StorageError::internal_with_source("invalid backend configuration", source)
            },
        }
    }
}

/// Classifies a driver error.
pub(crate) fn sqlx_error_to_storage_error(err: sqlx::Error) -> StorageError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StorageError::connection_with_source("database unreachable", err),

        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|code| code.into_owned());
            match code.as_deref() {
                Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED) => StorageError::conflict(),
                Some(QUERY_CANCELED) => {
                    tracing::warn!("statement timeout elapsed");
                    StorageError::timeout()
                },
                Some(code) if code.starts_with(CONNECTION_EXCEPTION_CLASS) => {
                    StorageError::connection_with_source("database connection exception", err)
                },
                _ => StorageError::internal_with_source("database error", err),
            }
        },

        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StorageError::serialization_with_source("row decode failed", err)
        },

        _ => StorageError::internal_with_source("database error", err),
    }
}
