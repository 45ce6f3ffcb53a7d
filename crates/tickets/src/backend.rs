//! Backend selection.
//!
//! [`Backend`] is the closed set of stores a deployment can pick from
//! configuration. It implements [`StorageBackend`] by delegating to the
//! selected variant, so the registry is compiled once against it.
//!
//! | Variant | Sharing | Native TTL | Single-use guarantee |
//! |---------|---------|------------|----------------------|
//! | `memory` | this process | yes | linearizable |
//! | `replicated` | every node on the bus | yes | per node, see [`crate::replication`] |
//! | `postgres` | every node on the database | no, swept by the cleaner | linearizable |

use std::{ops::RangeBounds, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tessera_storage::{KeyValue, MemoryBackend, StorageBackend, StorageResult, Transaction};
#[cfg(feature = "postgres")]
use tessera_storage_postgres::{PostgresBackend, PostgresBackendConfig};

use crate::{
    error::{ConfigError, TicketResult},
    replication::{MessageBus, ReplicatedBackend},
};

/// Which store to use.
///
/// ```
/// use tessera_tickets::BackendConfig;
///
/// let config: BackendConfig = serde_json::from_str(r#""replicated""#).unwrap();
/// assert!(matches!(config, BackendConfig::Replicated));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-process map with a background sweeper.
    #[default]
    Memory,
    /// In-process map replicated over a message bus.
    Replicated,
    /// Shared PostgreSQL table.
    #[cfg(feature = "postgres")]
    Postgres(PostgresBackendConfig),
}

/// A configured store.
#[derive(Debug, Clone)]
pub enum Backend {
    /// See [`MemoryBackend`].
    Memory(MemoryBackend),
    /// See [`ReplicatedBackend`].
    Replicated(ReplicatedBackend<MemoryBackend>),
    /// See [`PostgresBackend`].
    #[cfg(feature = "postgres")]
    Postgres(PostgresBackend),
}

impl Backend {
    /// Opens the store described by `config`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::MissingMessageBus`] for `replicated` without a bus
    /// - a storage error if the database cannot be reached or prepared
    #[tracing::instrument(skip_all, fields(node = node_id))]
    pub async fn from_config(
        config: &BackendConfig,
        node_id: &str,
        bus: Option<Arc<dyn MessageBus>>,
    ) -> TicketResult<Self> {
        let backend = match config {
            BackendConfig::Memory => Self::Memory(MemoryBackend::new()),
            BackendConfig::Replicated => {
                let bus = bus.ok_or(ConfigError::MissingMessageBus)?;
                Self::Replicated(ReplicatedBackend::new(MemoryBackend::new(), node_id, bus))
            },
            #[cfg(feature = "postgres")]
            BackendConfig::Postgres(config) => {
                let backend = PostgresBackend::connect(config.clone())
                    .await
                    .map_err(tessera_storage::StorageError::from)?;
                backend.ensure_schema().await.map_err(tessera_storage::StorageError::from)?;
                Self::Postgres(backend)
            },
        };
        tracing::info!(backend = backend.name(), "storage backend ready");
        Ok(backend)
    }

    /// Variant name, as used in configuration.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Replicated(_) => "replicated",
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => "postgres",
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $backend:ident => $call:expr) => {
        match $self {
            Backend::Memory($backend) => $call,
            Backend::Replicated($backend) => $call,
            #[cfg(feature = "postgres")]
            Backend::Postgres($backend) => $call,
        }
    };
}

#[async_trait]
impl StorageBackend for Backend {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        dispatch!(self, b => b.get(key).await)
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        dispatch!(self, b => b.set(key, value).await)
    }

    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        dispatch!(self, b => b.set_with_ttl(key, value, ttl).await)
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        dispatch!(self, b => b.compare_and_set(key, expected, new_value, ttl).await)
    }

    async fn compare_and_delete(&self, key: &[u8], expected: &[u8]) -> StorageResult<()> {
        dispatch!(self, b => b.compare_and_delete(key, expected).await)
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        dispatch!(self, b => b.delete(key).await)
    }

    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        dispatch!(self, b => b.get_range(range).await)
    }

    async fn clear_range<R>(&self, range: R) -> StorageResult<()>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        dispatch!(self, b => b.clear_range(range).await)
    }

    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>> {
        dispatch!(self, b => b.transaction().await)
    }

    async fn health_check(&self) -> StorageResult<()> {
        dispatch!(self, b => b.health_check().await)
    }

    fn has_native_ttl(&self) -> bool {
        dispatch!(self, b => b.has_native_ttl())
    }

    async fn purge_expired(&self) -> StorageResult<usize> {
        dispatch!(self, b => b.purge_expired().await)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{error::TicketError, replication::BroadcastBus};

    #[tokio::test]
    async fn memory_is_the_default() {
        let backend = Backend::from_config(&BackendConfig::default(), "node-1", None).await.unwrap();
        assert_eq!(backend.name(), "memory");
        assert!(backend.has_native_ttl());

        backend.set(b"k".to_vec(), b"v".to_vec()).await.unwrap();
        assert_eq!(backend.get(b"k").await.unwrap().unwrap(), Bytes::from_static(b"v"));
    }

    #[tokio::test]
    async fn replicated_requires_a_bus() {
        let err = Backend::from_config(&BackendConfig::Replicated, "node-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::Configuration(ConfigError::MissingMessageBus)));

        let bus: Arc<dyn MessageBus> = Arc::new(BroadcastBus::default());
        let backend =
            Backend::from_config(&BackendConfig::Replicated, "node-1", Some(bus)).await.unwrap();
        assert_eq!(backend.name(), "replicated");
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(serde_json::from_str::<BackendConfig>(r#""redis""#).is_err());
    }
}
