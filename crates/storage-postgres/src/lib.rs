//! PostgreSQL implementation of [`StorageBackend`](tessera_storage::StorageBackend).
//!
//! [`PostgresBackend`] stores every key in one table and is shared by all
//! nodes of a cluster, which makes it the durable option for the ticket
//! registry. Atomic operations map onto conditional SQL:
//!
//! | StorageBackend | SQL |
//! |----------------|-----|
//! | `compare_and_set(k, None, ..)` | `INSERT .. ON CONFLICT DO UPDATE .. WHERE expired` |
//! | `compare_and_set(k, Some(v), ..)` | `UPDATE .. WHERE value = v AND live` |
//! | `compare_and_delete(k, v)` | `DELETE .. WHERE value = v AND live` |
//! | `transaction()` | buffered, applied in one `BEGIN .. COMMIT` |
//!
//! A statement that touches zero rows is reported as
//! [`StorageError::Conflict`](tessera_storage::StorageError::Conflict).
//!
//! # TTL
//!
//! Expired rows are hidden from reads but never deleted by the backend
//! itself, so [`has_native_ttl`](tessera_storage::StorageBackend::has_native_ttl)
//! returns `false` and the registry's cleaner reclaims them.

#![deny(unsafe_code)]

mod backend;
mod config;
mod error;
mod transaction;

pub use backend::PostgresBackend;
pub use config::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_CONNECTIONS, DEFAULT_STATEMENT_TIMEOUT, DEFAULT_TABLE,
    PostgresBackendConfig,
};
pub use error::{PostgresStorageError, Result};
pub use transaction::PostgresTransaction;
