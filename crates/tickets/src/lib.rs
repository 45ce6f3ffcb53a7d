//! Ticket lifecycle for Tessera single sign-on.
//!
//! Tickets are short-lived opaque credentials: a ticket-granting ticket
//! (TGT) represents a login session, and service, proxy and OAuth tickets
//! are derived from it. This crate issues them, stores them through a
//! [`tessera_storage::StorageBackend`], validates and consumes them,
//! protects them at rest, and sweeps them once expired.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         TicketSystem                          │
//! ├──────────────────┬──────────────────────┬─────────────────────┤
//! │ TicketFactories  │  StorageTicketRegistry│  RegistryCleaner    │
//! │ (ids, policies,  │  (envelopes, cipher,  │  (batched sweeps,   │
//! │  parent links)   │   CAS consumption)    │   cluster lock)     │
//! ├──────────────────┴──────────────────────┴─────────────────────┤
//! │                  Backend: memory | replicated | postgres       │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use tessera_tickets::{
//!     Authentication, Backend, BackendConfig, IssueRequest, RegistryConfig, TicketKind,
//!     TicketSystem, Validation,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RegistryConfig::default();
//!     let backend = Backend::from_config(&BackendConfig::Memory, config.node_id(), None).await?;
//!     let system = TicketSystem::builder().backend(Arc::new(backend)).config(&config).build()?;
//!
//!     let login = IssueRequest::builder()
//!         .authentication(Authentication::builder().principal("alice").build())
//!         .build();
//!     let tgt = system.create(TicketKind::TicketGranting, login).await?;
//!
//!     let request =
//!         IssueRequest::builder().parent(tgt.id()).service("https://app.example.org").build();
//!     let st = system.create(TicketKind::Service, request).await?;
//!
//!     match system.validate(st.id(), TicketKind::Service).await? {
//!         Validation::Valid(ticket) => assert_eq!(ticket.principal(), "alice"),
//!         other => panic!("unexpected outcome: {other:?}"),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`postgres`**: adds [`Backend::Postgres`] over `tessera-storage-postgres`.
//! - **`testutil`**: enables the [`testutil`] fixtures.
//! - **`failpoints`**: activates the `registry-before-consume` and `cleaner-before-delete`
//!   injection points.

#![deny(unsafe_code)]

pub mod backend;
pub mod catalog;
pub mod cipher;
pub mod cleaner;
pub mod clock;
pub mod config;
mod consumed;
pub mod error;
pub mod expiration;
pub mod factory;
pub mod id;
pub mod locking;
pub mod metrics;
pub mod registry;
pub mod replication;
pub mod system;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod ticket;

pub use backend::{Backend, BackendConfig};
pub use catalog::{TicketCatalog, TicketDefinition, TicketKind, TicketOverride};
pub use cipher::{AesHmacCipher, CipherConfig, CipherExecutor, NoOpCipher};
pub use cleaner::{CLEANER_LOCK, CleanReport, CleanerHandle, RegistryCleaner};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CleanerConfig, LockMode, RegistryConfig};
pub use error::{ConfigError, TicketError, TicketResult};
pub use expiration::{ExpirationPolicy, MAX_TIME_TO_LIVE};
pub use factory::{IssueRequest, TicketFactories, TicketFactory};
pub use id::{IdConfig, TicketIdGenerator};
pub use locking::{LockingStrategy, NoOpLock, StorageLeaseLock};
pub use metrics::{RegistryMetrics, RegistryMetricsSnapshot};
pub use registry::{StorageTicketRegistry, TicketFilter, TicketRegistry, Validation};
pub use replication::{BroadcastBus, ChangeEvent, ChangeOp, MessageBus, ReplicatedBackend};
pub use system::TicketSystem;
pub use ticket::{
    Authentication, OAuthGrant, ServiceGrant, SessionGrant, Ticket, TicketPayload, TicketState,
    redact_id,
};
