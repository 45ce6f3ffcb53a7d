//! PostgreSQL-backed storage backend implementation.

use std::{
    ops::{Bound, RangeBounds},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::{
    PgPool, Postgres, QueryBuilder,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use tessera_storage::{KeyValue, StorageBackend, StorageError, StorageResult, Transaction};

use crate::{
    config::{PostgresBackendConfig, validate_identifier},
    error::{Result, sqlx_error_to_storage_error},
    transaction::PostgresTransaction,
};

/// Row predicate selecting entries whose TTL has not elapsed.
pub(crate) const LIVE: &str = "(expires_at IS NULL OR expires_at > now())";

/// SQL text for every statement, rendered once for the configured table.
#[derive(Debug)]
pub(crate) struct Statements {
    pub(crate) table: String,
    pub(crate) get: String,
    pub(crate) upsert: String,
    pub(crate) insert_if_absent: String,
    pub(crate) update_if: String,
    pub(crate) delete_if: String,
    pub(crate) delete: String,
    pub(crate) purge_expired: String,
}

impl Statements {
    fn new(table: &str) -> Self {
        let expiry = "now() + make_interval(secs => $3)";
        let upsert = format!(
            "INSERT INTO {table} (key, value, expires_at) VALUES ($1, $2, {expiry}) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at"
        );
        Self {
            table: table.to_owned(),
            get: format!("SELECT value FROM {table} WHERE key = $1 AND {LIVE}"),
            // An expired row counts as absent, so it may be overwritten.
            insert_if_absent: format!(
                "{upsert} WHERE {table}.expires_at IS NOT NULL AND {table}.expires_at <= now()"
            ),
            upsert,
            update_if: format!(
                "UPDATE {table} SET value = $2, expires_at = {expiry} \
                 WHERE key = $1 AND value = $4 AND {LIVE}"
            ),
            delete_if: format!("DELETE FROM {table} WHERE key = $1 AND value = $2 AND {LIVE}"),
            delete: format!("DELETE FROM {table} WHERE key = $1"),
            purge_expired: format!(
                "DELETE FROM {table} WHERE expires_at IS NOT NULL AND expires_at <= now()"
            ),
        }
    }
}

/// Seconds bound to `make_interval`; `None` stores no expiry.
pub(crate) fn ttl_seconds(ttl: Option<Duration>) -> Option<f64> {
    ttl.map(|ttl| ttl.as_secs_f64())
}

fn push_bounds<R: RangeBounds<Vec<u8>>>(query: &mut QueryBuilder<'_, Postgres>, range: &R) {
    match range.start_bound() {
        Bound::Included(start) => {
            query.push(" AND key >= ").push_bind(start.clone());
        },
        Bound::Excluded(start) => {
            query.push(" AND key > ").push_bind(start.clone());
        },
        Bound::Unbounded => {},
    }
    match range.end_bound() {
        Bound::Included(end) => {
            query.push(" AND key <= ").push_bind(end.clone());
        },
        Bound::Excluded(end) => {
            query.push(" AND key < ").push_bind(end.clone());
        },
        Bound::Unbounded => {},
    }
}

/// [`StorageBackend`] over a single PostgreSQL table.
///
/// Rows are `(key BYTEA PRIMARY KEY, value BYTEA, expires_at TIMESTAMPTZ)`.
/// `bytea` compares bytewise, so range scans follow the same ordering as
/// the in-memory backend. Expired rows are filtered from every read but are
/// only removed by an explicit delete; [`has_native_ttl`](StorageBackend::has_native_ttl)
/// is therefore `false` and consumers run a sweeper.
///
/// Expirations are computed with the database clock, so nodes with skewed
/// clocks still agree on when an entry dies.
///
/// # Example
///
/// ```no_run
/// // Requires a running PostgreSQL server.
/// use tessera_storage::StorageBackend;
/// use tessera_storage_postgres::{PostgresBackend, PostgresBackendConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = PostgresBackendConfig::builder().url("postgres://localhost/tessera").build()?;
///     let backend = PostgresBackend::connect(config).await?;
///     backend.ensure_schema().await?;
///
///     backend.set(b"key".to_vec(), b"value".to_vec()).await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    statements: Arc<Statements>,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("table", &self.statements.table)
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl PostgresBackend {
    /// Opens a connection pool described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the first
    /// connection cannot be established.
    pub async fn connect(config: PostgresBackendConfig) -> Result<Self> {
        config.validate()?;

        let statement_timeout_ms = config.statement_timeout.as_millis().to_string();
        let options = config
            .url
            .parse::<PgConnectOptions>()?
            .options([("statement_timeout", statement_timeout_ms)]);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect_with(options)
            .await?;

        tracing::info!(table = %config.table, max_connections = config.max_connections, "connected to PostgreSQL");
        Ok(Self { pool, statements: Arc::new(Statements::new(&config.table)) })
    }

    /// Wraps an existing pool.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `table` is not a valid identifier.
    pub fn from_pool(pool: PgPool, table: &str) -> Result<Self> {
        validate_identifier(table)?;
        Ok(Self { pool, statements: Arc::new(Statements::new(table)) })
    }

    /// Creates the table and its expiry index if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns a driver error if the DDL fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        let table = &self.statements.table;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                key BYTEA PRIMARY KEY, \
                value BYTEA NOT NULL, \
                expires_at TIMESTAMPTZ\
            )"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_expires_at_idx ON {table} (expires_at) \
             WHERE expires_at IS NOT NULL"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> StorageResult<()> {
        sqlx::query(&self.statements.upsert)
            .bind(key)
            .bind(value)
            .bind(ttl_seconds(ttl))
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_storage_error)?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        let value: Option<Vec<u8>> = sqlx::query_scalar(&self.statements.get)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_storage_error)?;
        Ok(value.map(Bytes::from))
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len(), value_len = value.len()))]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.upsert(&key, &value, None).await
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len(), ttl_ms = ttl.as_millis() as u64))]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        self.upsert(&key, &value, Some(ttl)).await
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len(), insert = expected.is_none()))]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let result = match expected {
            None => {
                sqlx::query(&self.statements.insert_if_absent)
                    .bind(key)
                    .bind(new_value)
                    .bind(ttl_seconds(ttl))
                    .execute(&self.pool)
                    .await
            },
            Some(expected) => {
                sqlx::query(&self.statements.update_if)
                    .bind(key)
                    .bind(new_value)
                    .bind(ttl_seconds(ttl))
                    .bind(expected)
                    .execute(&self.pool)
                    .await
            },
        }
        .map_err(sqlx_error_to_storage_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::conflict());
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn compare_and_delete(&self, key: &[u8], expected: &[u8]) -> StorageResult<()> {
        let result = sqlx::query(&self.statements.delete_if)
            .bind(key)
            .bind(expected)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_storage_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::conflict());
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        sqlx::query(&self.statements.delete)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_storage_error)?;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT key, value FROM {} WHERE {LIVE}",
            self.statements.table
        ));
        push_bounds(&mut query, &range);
        query.push(" ORDER BY key");

        let rows: Vec<(Vec<u8>, Vec<u8>)> = query
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_storage_error)?;

        Ok(rows.into_iter().map(|(k, v)| KeyValue::new(Bytes::from(k), Bytes::from(v))).collect())
    }

    #[tracing::instrument(skip_all)]
    async fn clear_range<R>(&self, range: R) -> StorageResult<()>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        let mut query =
            QueryBuilder::<Postgres>::new(format!("DELETE FROM {} WHERE TRUE", self.statements.table));
        push_bounds(&mut query, &range);

        query.build().execute(&self.pool).await.map_err(sqlx_error_to_storage_error)?;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>> {
        Ok(Box::new(PostgresTransaction::new(self.pool.clone(), Arc::clone(&self.statements))))
    }

    async fn health_check(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(sqlx_error_to_storage_error)?;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn purge_expired(&self) -> StorageResult<usize> {
        let result = sqlx::query(&self.statements.purge_expired)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_storage_error)?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_target_configured_table() {
        let statements = Statements::new("sso_kv");
        assert!(statements.get.starts_with("SELECT value FROM sso_kv "));
        assert!(statements.insert_if_absent.contains("ON CONFLICT (key)"));
        assert!(statements.insert_if_absent.ends_with("sso_kv.expires_at <= now()"));
        assert!(statements.update_if.contains("value = $4"));
        assert!(statements.delete_if.contains(LIVE));
    }

    #[test]
    fn bounds_render_in_order() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT key FROM t WHERE TRUE");
        push_bounds(&mut query, &(b"a".to_vec()..b"b".to_vec()));
        assert_eq!(query.sql(), "SELECT key FROM t WHERE TRUE AND key >= $1 AND key < $2");

        let mut query = QueryBuilder::<Postgres>::new("SELECT key FROM t WHERE TRUE");
        push_bounds(&mut query, &(..));
        assert_eq!(query.sql(), "SELECT key FROM t WHERE TRUE");
    }

    #[test]
    fn ttl_converts_to_fractional_seconds() {
        assert_eq!(ttl_seconds(Some(Duration::from_millis(1500))), Some(1.5));
        assert_eq!(ttl_seconds(None), None);
    }
}
