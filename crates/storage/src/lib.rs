//! Key-value storage abstraction for the Tessera ticket registry.
//!
//! This crate provides the [`StorageBackend`] trait that ticket registries
//! persist through, an in-memory implementation, and the retry and metrics
//! plumbing shared by every backend consumer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Ticket Registry                         │
//! │   (envelopes, expiration policies, cascades, validation)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │                    tessera-storage                          │
//! │                 StorageBackend trait                        │
//! │  (get, set_with_ttl, compare_and_set, compare_and_delete,   │
//! │   get_range, transaction)                                   │
//! ├──────────────┬──────────────────────────────────────────────┤
//! │ MemoryBackend│   PostgresBackend (tessera-storage-postgres) │
//! │ (single node)│              (shared, durable)               │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//!
//! use tessera_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!
//!     backend
//!         .set_with_ttl(b"service-tickets/ST-1".to_vec(), b"{}".to_vec(), Duration::from_secs(10))
//!         .await?;
//!
//!     // A single-use ticket is consumed by whoever removes it first.
//!     backend.compare_and_delete(b"service-tickets/ST-1", b"{}").await?;
//!     assert!(backend.get(b"service-tickets/ST-1").await?.is_none());
//!
//!     Ok(())
//! }
//! ```
//!
//! # Available Backends
//!
//! | Backend | Use Case | Persistence | Native TTL |
//! |---------|----------|-------------|------------|
//! | [`MemoryBackend`] | Single node, tests | No | Yes (sweeper) |
//! | `PostgresBackend` (in `tessera-storage-postgres`) | Clustered deployments | Yes | No |
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the [`testutil`] helpers and the [`conformance`] suite so that other
//!   backend crates can run the same contract checks.
//! - **`failpoints`**: Activates the `fail` crate's injection points in the retry loops.

#![deny(unsafe_code)]

pub mod backend;
pub mod config;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod conformance;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod retry;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod transaction;
pub mod types;

pub use backend::StorageBackend;
pub use config::{CasRetryConfig, RetryConfig};
pub use error::{BoxError, ConfigError, StorageError, StorageResult, TimeoutContext};
pub use memory::MemoryBackend;
pub use metrics::{Metrics, MetricsSnapshot};
pub use retry::{with_cas_retry, with_retry_timeout};
pub use transaction::Transaction;
pub use types::{KeyValue, prefix_range};
