//! Transaction implementation for the PostgreSQL storage backend.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::PgPool;
use tessera_storage::{StorageError, StorageResult, Transaction};

use crate::{
    backend::{Statements, ttl_seconds},
    error::sqlx_error_to_storage_error,
};

/// Compare-and-set operation verified at commit time.
#[derive(Debug, Clone)]
struct CasOperation {
    key: Vec<u8>,
    /// `None` means the key must be absent.
    expected: Option<Vec<u8>>,
    new_value: Vec<u8>,
}

/// Buffered transaction applied inside a single SQL transaction.
///
/// Reads observe pending writes first and otherwise go to the pool, so two
/// reads of an untouched key may disagree if another writer commits in
/// between. Buffered compare-and-set operations run first at commit as
/// conditional statements; if any matches no row the SQL transaction is
/// rolled back and [`StorageError::Conflict`] is returned.
pub struct PostgresTransaction {
    pool: PgPool,
    statements: Arc<Statements>,
    pending_writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    pending_cas: Vec<CasOperation>,
}

impl PostgresTransaction {
    pub(crate) fn new(pool: PgPool, statements: Arc<Statements>) -> Self {
        Self { pool, statements, pending_writes: BTreeMap::new(), pending_cas: Vec::new() }
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        if let Some(pending) = self.pending_writes.get(key) {
            return Ok(pending.as_ref().map(|v| Bytes::copy_from_slice(v)));
        }

        let value: Option<Vec<u8>> = sqlx::query_scalar(&self.statements.get)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_storage_error)?;
        Ok(value.map(Bytes::from))
    }

    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.pending_writes.insert(key, Some(value));
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.pending_writes.insert(key, None);
    }

    fn compare_and_set(
        &mut self,
        key: Vec<u8>,
        expected: Option<Vec<u8>>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        self.pending_cas.push(CasOperation { key, expected, new_value });
        Ok(())
    }

    #[tracing::instrument(
        skip_all,
        fields(writes = self.pending_writes.len(), cas = self.pending_cas.len())
    )]
    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let statements = &self.statements;
        let mut tx = self.pool.begin().await.map_err(sqlx_error_to_storage_error)?;

        for cas in &self.pending_cas {
            let result = match &cas.expected {
                None => {
                    sqlx::query(&statements.insert_if_absent)
                        .bind(&cas.key)
                        .bind(&cas.new_value)
                        .bind(ttl_seconds(None))
                        .execute(&mut *tx)
                        .await
                },
                Some(expected) => {
                    sqlx::query(&statements.update_if)
                        .bind(&cas.key)
                        .bind(&cas.new_value)
                        .bind(ttl_seconds(None))
                        .bind(expected)
                        .execute(&mut *tx)
                        .await
                },
            }
            .map_err(sqlx_error_to_storage_error)?;

            if result.rows_affected() == 0 {
                // Dropping `tx` rolls back.
                return Err(StorageError::conflict());
            }
        }

        for (key, value) in &self.pending_writes {
            let result = match value {
                Some(value) => {
                    sqlx::query(&statements.upsert)
                        .bind(key)
                        .bind(value)
                        .bind(ttl_seconds(None))
                        .execute(&mut *tx)
                        .await
                },
                None => sqlx::query(&statements.delete).bind(key).execute(&mut *tx).await,
            };
            result.map_err(sqlx_error_to_storage_error)?;
        }

        tx.commit().await.map_err(sqlx_error_to_storage_error)
    }
}
