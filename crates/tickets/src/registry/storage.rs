//! [`TicketRegistry`] over a [`StorageBackend`].
//!
//! # Layout
//!
//! Each ticket is one record at `{storage_name}/{key_id}` holding a JSON
//! envelope:
//!
//! ```text
//! { "id", "kind", "expires_at", "principal", "service", "body" }
//! ```
//!
//! `body` is the base64 of the serialized ticket after the cipher. For a
//! kind that is encrypted while the cipher is enabled, `key_id`, `id`,
//! `principal` and `service` are hex SHA-512 digests, so plaintext ids and
//! principals never reach the store. Records carry a storage TTL derived
//! from the policy's expiry; on backends without native eviction a grace
//! period is added so the cleaner still sees expired sessions and can
//! cascade their deletion.
//!
//! # Atomicity
//!
//! - Spending a ticket is a compare-and-delete on the exact bytes that were
//!   read, so exactly one concurrent validation wins.
//! - Other usage updates are compare-and-set, restarted on conflict.
//! - Cascading deletes are applied in one storage transaction.

use std::{
    collections::{BTreeSet, VecDeque},
    fmt,
    future::Future,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use fail::fail_point;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tessera_storage::{
    CasRetryConfig, RetryConfig, StorageBackend, StorageError, StorageResult, prefix_range,
    with_cas_retry, with_retry_timeout,
};

use super::{TicketFilter, TicketRegistry, Validation};
use crate::{
    catalog::{TicketCatalog, TicketDefinition, TicketKind},
    cipher::CipherExecutor,
    clock::{Clock, SystemClock, remaining},
    config::{Coordination, RegistryConfig},
    consumed::ConsumedTickets,
    error::{ConfigError, TicketError, TicketResult},
    locking::{LockingStrategy, StorageLeaseLock},
    metrics::RegistryMetrics,
    ticket::{Ticket, redact_id},
};

/// Stored form of a ticket.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    id: String,
    kind: TicketKind,
    expires_at: DateTime<Utc>,
    #[serde(default)]
    principal: Option<String>,
    #[serde(default)]
    service: Option<String>,
    body: String,
}

fn digest(value: &str) -> String {
    hex::encode(Sha512::digest(value.as_bytes()))
}

/// Settings copied out of [`RegistryConfig`].
#[derive(Debug, Clone)]
struct Settings {
    coordination: Coordination,
    lock_timeout: Duration,
    operation_timeout: Duration,
    retry: RetryConfig,
    cas_retry: CasRetryConfig,
    remove_descendants: bool,
    ttl_grace: Duration,
}

/// Registry storing tickets in a [`StorageBackend`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tessera_storage::MemoryBackend;
/// use tessera_tickets::{
///     RegistryConfig, StorageTicketRegistry, TicketKind, TicketRegistry, Validation,
/// };
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = StorageTicketRegistry::builder()
///     .backend(Arc::new(MemoryBackend::new()))
///     .config(&RegistryConfig::default())
///     .build()?;
///
/// let outcome = registry.validate("ST-1-unknown", TicketKind::Service).await?;
/// assert_eq!(outcome, Validation::NotFound);
/// # Ok(())
/// # }
/// ```
pub struct StorageTicketRegistry<B> {
    backend: Arc<B>,
    catalog: Arc<TicketCatalog>,
    cipher: Arc<dyn CipherExecutor>,
    clock: Arc<dyn Clock>,
    lock: Arc<dyn LockingStrategy>,
    consumed: ConsumedTickets,
    metrics: RegistryMetrics,
    settings: Settings,
}

impl<B> fmt::Debug for StorageTicketRegistry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageTicketRegistry")
            .field("cipher", &self.cipher)
            .field("lock", &self.lock)
            .field("consumed", &self.consumed)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl<B: StorageBackend + 'static> StorageTicketRegistry<B> {
    /// Creates a registry over `backend`.
    ///
    /// The catalog and cipher are built from `config`; the cluster lock is
    /// a lease lock in the same backend owned by `config.node_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` does not validate.
    #[builder]
    pub fn new(
        backend: Arc<B>,
        config: &RegistryConfig,
        #[builder(default = Arc::new(SystemClock))] clock: Arc<dyn Clock>,
        #[builder(default)] metrics: RegistryMetrics,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let catalog = Arc::new(config.catalog()?);
        let cipher = config.cipher().build_executor()?;
        let lock: Arc<dyn LockingStrategy> = Arc::new(StorageLeaseLock::new(
            Arc::clone(&backend),
            config.node_id(),
            config.lock_lease(),
        ));
        let ttl_grace = if backend.has_native_ttl() {
            Duration::ZERO
        } else {
            config.cleaner().repeat_interval()
        };

        Ok(Self {
            backend,
            catalog,
            cipher,
            clock,
            lock,
            consumed: ConsumedTickets::new(config.consumed_capacity(), config.consumed_retention()),
            metrics,
            settings: Settings {
                coordination: config.lock_mode().coordination(),
                lock_timeout: config.lock_timeout(),
                operation_timeout: config.operation_timeout(),
                retry: config.retry().clone(),
                cas_retry: config.cas_retry().clone(),
                remove_descendants: config.remove_descendants(),
                ttl_grace,
            },
        })
    }

    /// The validated ticket catalog.
    #[must_use]
    pub fn catalog(&self) -> &Arc<TicketCatalog> {
        &self.catalog
    }

    /// The lease lock used for pessimistic updates and the cleaner, exclusive
    /// among the nodes that share this backend.
    #[must_use]
    pub fn locks(&self) -> Arc<dyn LockingStrategy> {
        Arc::clone(&self.lock)
    }

    /// The injected clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Lifecycle counters.
    #[must_use]
    pub fn metrics(&self) -> &RegistryMetrics {
        &self.metrics
    }

    /// The underlying backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    fn protects(&self, definition: &TicketDefinition) -> bool {
        definition.encrypted() && self.cipher.is_enabled()
    }

    fn indexed(&self, definition: &TicketDefinition, value: &str) -> String {
        if self.protects(definition) { digest(value) } else { value.to_owned() }
    }

    fn storage_key(&self, definition: &TicketDefinition, id: &str) -> Vec<u8> {
        format!("{}/{}", definition.storage_name(), self.indexed(definition, id)).into_bytes()
    }

    fn resolve(&self, id: &str, expected: Option<TicketKind>) -> Option<&TicketDefinition> {
        let definition = self.catalog.find_by_id(id)?;
        match expected {
            Some(kind) if kind != definition.kind() => None,
            _ => Some(definition),
        }
    }

    fn ttl(&self, ticket: &Ticket, now: DateTime<Utc>) -> Duration {
        remaining(now, ticket.expires_at()).saturating_add(self.settings.ttl_grace)
    }

    fn seal(&self, definition: &TicketDefinition, ticket: &Ticket) -> StorageResult<Vec<u8>> {
        let json = serde_json::to_vec(ticket)
            .map_err(|e| StorageError::serialization_with_source("ticket encoding failed", e))?;
        let body = if self.protects(definition) {
            self.cipher
                .encode(&json)
                .map_err(|e| StorageError::internal_with_source("ticket encryption failed", e))?
        } else {
            json
        };

        let envelope = Envelope {
            id: self.indexed(definition, ticket.id()),
            kind: ticket.kind(),
            expires_at: ticket.expires_at(),
            principal: Some(self.indexed(definition, ticket.principal())),
            service: ticket.service().map(|s| self.indexed(definition, s)),
            body: BASE64.encode(body),
        };
        serde_json::to_vec(&envelope)
            .map_err(|e| StorageError::serialization_with_source("envelope encoding failed", e))
    }

    /// Decodes a record. Every failure is reported as `None`.
    fn open(&self, definition: &TicketDefinition, raw: &[u8]) -> Option<Ticket> {
        let envelope: Envelope = match serde_json::from_slice(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(kind = %definition.kind(), error = %err, "unreadable ticket record");
                return None;
            },
        };
        if envelope.kind != definition.kind() {
            return None;
        }
        let body = BASE64.decode(envelope.body.as_bytes()).ok()?;
        let json = if self.protects(definition) {
            match self.cipher.decode(&body) {
                Some(json) => json,
                None => {
                    tracing::warn!(kind = %definition.kind(), "ticket record failed verification");
                    return None;
                },
            }
        } else {
            body
        };
        let ticket: Ticket = serde_json::from_slice(&json).ok()?;

        // The envelope must describe the ticket it carries.
        (ticket.kind() == definition.kind()
            && self.indexed(definition, ticket.id()) == envelope.id)
            .then_some(ticket)
    }

    async fn call<T, F, Fut>(&self, operation: &str, f: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        with_retry_timeout(
            &self.settings.retry,
            self.settings.operation_timeout,
            Some(self.metrics.storage()),
            operation,
            f,
        )
        .await
    }

    async fn write(&self, ticket: &Ticket) -> TicketResult<()> {
        let definition = self.resolve(ticket.id(), Some(ticket.kind())).ok_or_else(|| {
            TicketError::invalid_request(format!(
                "id {} does not carry the {} prefix",
                redact_id(ticket.id()),
                ticket.kind()
            ))
        })?;
        let key = self.storage_key(definition, ticket.id());
        let value = self.seal(definition, ticket)?;
        let ttl = self.ttl(ticket, self.clock.now());

        self.call("set_with_ttl", || self.backend.set_with_ttl(key.clone(), value.clone(), ttl))
            .await?;
        Ok(())
    }

    /// Reads, decodes and filters out policy-expired tickets.
    async fn read_live(&self, definition: &TicketDefinition, id: &str) -> StorageResult<Option<Ticket>> {
        let key = self.storage_key(definition, id);
        let Some(raw) = self.call("get", || self.backend.get(&key)).await? else {
            return Ok(None);
        };
        Ok(self.open(definition, &raw).filter(|t| t.id() == id && !t.is_expired(self.clock.now())))
    }

    async fn scan(&self, definition: &TicketDefinition) -> StorageResult<Vec<Ticket>> {
        let prefix = format!("{}/", definition.storage_name());
        let entries = self
            .call("get_range", || self.backend.get_range(prefix_range(prefix.as_bytes())))
            .await?;
        Ok(entries.iter().filter_map(|entry| self.open(definition, &entry.value)).collect())
    }

    async fn validate_once(
        &self,
        definition: &TicketDefinition,
        id: &str,
        key: &[u8],
    ) -> StorageResult<Validation> {
        let Some(raw) = self.call("get", || self.backend.get(key)).await? else {
            if self.consumed.contains(id) {
                tracing::warn!(ticket = %redact_id(id), "consumed ticket presented again");
                return Ok(Validation::AlreadyConsumed);
            }
            return Ok(Validation::NotFound);
        };
        let Some(ticket) = self.open(definition, &raw).filter(|t| t.id() == id) else {
            return Ok(Validation::NotFound);
        };

        let now = self.clock.now();
        if ticket.is_expired(now) {
            return Ok(Validation::Expired);
        }
        if !ticket.policy().allows_use(ticket.state(), now) {
            return Ok(Validation::Throttled);
        }

        let used = ticket.used_at(now);
        if spends(definition.kind(), &used, now) {
            before_consume()?;
            return match self
                .call("compare_and_delete", || self.backend.compare_and_delete(key, &raw))
                .await
            {
                Ok(()) => {
                    self.consumed.record(id).await;
                    Ok(Validation::Valid(used))
                },
                Err(StorageError::Conflict) => {
                    // Still present means the record changed under us; start over.
                    if self.call("get", || self.backend.get(key)).await?.is_some() {
                        return Err(StorageError::Conflict);
                    }
                    tracing::warn!(ticket = %redact_id(id), "lost race to consume ticket");
                    Ok(Validation::AlreadyConsumed)
                },
                Err(err) => Err(err),
            };
        }

        let sealed = self.seal(definition, &used)?;
        let ttl = self.ttl(&used, now);
        self.call("compare_and_set", || {
            self.backend.compare_and_set(key, Some(&raw), sealed.clone(), Some(ttl))
        })
        .await?;
        Ok(Validation::Valid(used))
    }

    /// One read-modify-write of a parent's descendant set. `None` means the
    /// parent is missing or expired.
    async fn attach_once(
        &self,
        definition: &TicketDefinition,
        parent_id: &str,
        child_id: &str,
        conditional: bool,
    ) -> StorageResult<Option<Ticket>> {
        let key = self.storage_key(definition, parent_id);
        let Some(raw) = self.call("get", || self.backend.get(&key)).await? else {
            return Ok(None);
        };
        let now = self.clock.now();
        let Some(parent) = self
            .open(definition, &raw)
            .filter(|t| t.id() == parent_id && !t.is_expired(now))
        else {
            return Ok(None);
        };

        let mut updated = parent.used_at(now);
        updated.add_descendant(child_id);
        let sealed = self.seal(definition, &updated)?;
        let ttl = self.ttl(&updated, now);

        if conditional {
            self.call("compare_and_set", || {
                self.backend.compare_and_set(&key, Some(&raw), sealed.clone(), Some(ttl))
            })
            .await?;
        } else {
            self.call("set_with_ttl", || self.backend.set_with_ttl(key.clone(), sealed.clone(), ttl))
                .await?;
        }
        Ok(Some(updated))
    }

    /// Ids to remove when deleting `id`: the ticket itself, plus every
    /// transitive descendant when cascading.
    async fn deletion_set(&self, id: &str) -> StorageResult<Vec<String>> {
        let mut ids = vec![id.to_owned()];
        if !self.settings.remove_descendants {
            return Ok(ids);
        }

        let mut seen: BTreeSet<String> = ids.iter().cloned().collect();
        let mut queue = VecDeque::from([id.to_owned()]);
        while let Some(current) = queue.pop_front() {
            let Some(definition) = self.catalog.find_by_id(&current) else {
                continue;
            };
            if !definition.kind().is_session() {
                continue;
            }
            let key = self.storage_key(definition, &current);
            let Some(raw) = self.call("get", || self.backend.get(&key)).await? else {
                continue;
            };
            let Some(ticket) = self.open(definition, &raw) else {
                continue;
            };
            for child in ticket.descendants() {
                if seen.insert(child.to_owned()) {
                    ids.push(child.to_owned());
                    queue.push_back(child.to_owned());
                }
            }
        }
        Ok(ids)
    }

    async fn delete_keys(&self, keys: &[Vec<u8>]) -> StorageResult<usize> {
        let mut txn = self.backend.transaction().await?;
        let mut removed = 0;
        for key in keys {
            if txn.get(key).await?.is_some() {
                removed += 1;
            }
            // Expired records are invisible to `get` but still removed.
            txn.delete(key.clone());
        }
        txn.commit().await?;
        Ok(removed)
    }

    fn contention(&self, err: StorageError, id: &str) -> TicketError {
        match err {
            StorageError::CasRetriesExhausted { .. } => TicketError::contention(redact_id(id)),
            other => other.into(),
        }
    }
}

/// Whether the use recorded in `used` is the ticket's last.
fn spends(kind: TicketKind, used: &Ticket, now: DateTime<Utc>) -> bool {
    used.is_expired(now) || (kind.is_single_use() && !used.policy().is_use_limited())
}

fn before_consume() -> StorageResult<()> {
    fail_point!("registry-before-consume", |_| {
        Err(StorageError::internal("injected failure before consumption"))
    });
    Ok(())
}

#[async_trait]
impl<B: StorageBackend + 'static> TicketRegistry for StorageTicketRegistry<B> {
    #[tracing::instrument(skip_all, fields(ticket = %redact_id(ticket.id()), kind = %ticket.kind()))]
    async fn add_ticket(&self, ticket: &Ticket) -> TicketResult<()> {
        self.write(ticket).await
    }

    #[tracing::instrument(skip_all, fields(ticket = %redact_id(id)))]
    async fn get_ticket(
        &self,
        id: &str,
        expected: Option<TicketKind>,
    ) -> TicketResult<Option<Ticket>> {
        let Some(definition) = self.resolve(id, expected) else {
            return Ok(None);
        };
        Ok(self.read_live(definition, id).await?)
    }

    #[tracing::instrument(skip_all, fields(ticket = %redact_id(ticket.id()), kind = %ticket.kind()))]
    async fn update_ticket(&self, ticket: &Ticket) -> TicketResult<()> {
        self.write(ticket).await
    }

    #[tracing::instrument(skip_all, fields(ticket = %redact_id(id), cascade = self.settings.remove_descendants))]
    async fn delete_ticket(&self, id: &str) -> TicketResult<usize> {
        let ids = self.deletion_set(id).await?;
        let keys: Vec<Vec<u8>> = ids
            .iter()
            .filter_map(|id| self.catalog.find_by_id(id).map(|d| self.storage_key(d, id)))
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }

        let removed = self.call("delete_ticket", || self.delete_keys(&keys)).await?;
        tracing::debug!(removed, "deleted tickets");
        self.metrics.record_deleted(removed);
        Ok(removed)
    }

    #[tracing::instrument(skip_all)]
    async fn delete_all(&self) -> TicketResult<usize> {
        let mut removed = 0;
        for definition in self.catalog.definitions() {
            let prefix = format!("{}/", definition.storage_name());
            let entries = self
                .call("get_range", || self.backend.get_range(prefix_range(prefix.as_bytes())))
                .await?;
            self.call("clear_range", || self.backend.clear_range(prefix_range(prefix.as_bytes())))
                .await?;
            removed += entries.len();
        }
        self.metrics.record_deleted(removed);
        Ok(removed)
    }

    #[tracing::instrument(skip_all, fields(kind = %kind))]
    async fn get_tickets(
        &self,
        kind: TicketKind,
        filter: TicketFilter<'_>,
    ) -> TicketResult<Vec<Ticket>> {
        let now = self.clock.now();
        let tickets = self.scan(self.catalog.definition(kind)).await?;
        Ok(tickets.into_iter().filter(|t| !t.is_expired(now) && filter(t)).collect())
    }

    #[tracing::instrument(skip_all, fields(kind = %kind, limit))]
    async fn expired_tickets(&self, kind: TicketKind, limit: usize) -> TicketResult<Vec<Ticket>> {
        let now = self.clock.now();
        let tickets = self.scan(self.catalog.definition(kind)).await?;
        Ok(tickets.into_iter().filter(|t| t.is_expired(now)).take(limit).collect())
    }

    #[tracing::instrument(skip_all, fields(ticket = %redact_id(id), kind = %kind))]
    async fn validate(&self, id: &str, kind: TicketKind) -> TicketResult<Validation> {
        let outcome = match self.resolve(id, Some(kind)) {
            None => Validation::NotFound,
            Some(definition) => {
                let key = self.storage_key(definition, id);
                with_cas_retry(&self.settings.cas_retry, || self.validate_once(definition, id, &key))
                    .await
                    .map_err(|e| self.contention(e, id))?
            },
        };
        self.metrics.record_validation(&outcome);
        Ok(outcome)
    }

    #[tracing::instrument(
        skip_all,
        fields(parent = %redact_id(parent_id), child = %redact_id(child_id))
    )]
    async fn attach_descendant(&self, parent_id: &str, child_id: &str) -> TicketResult<Ticket> {
        let invalid = |reason: &str| TicketError::invalid_parent(redact_id(parent_id), reason);
        let definition = self.resolve(parent_id, None).ok_or_else(|| invalid("unknown prefix"))?;
        if !definition.kind().is_session() {
            return Err(invalid("not a session-granting ticket"));
        }

        let updated = match self.settings.coordination {
            Coordination::Unsynchronized => {
                self.attach_once(definition, parent_id, child_id, false).await?
            },
            Coordination::Optimistic => with_cas_retry(&self.settings.cas_retry, || {
                self.attach_once(definition, parent_id, child_id, true)
            })
            .await
            .map_err(|e| self.contention(e, parent_id))?,
            Coordination::Pessimistic => {
                let resource = format!("ticket/{}", self.indexed(definition, parent_id));
                self.lock.lock(&resource, self.settings.lock_timeout).await?;
                let result = self.attach_once(definition, parent_id, child_id, false).await;
                if let Err(err) = self.lock.unlock(&resource).await {
                    tracing::warn!(error = %err, "failed to release ticket lock");
                }
                result?
            },
        };
        updated.ok_or_else(|| invalid("missing or expired"))
    }

    #[tracing::instrument(skip_all)]
    async fn purge_expired(&self) -> TicketResult<usize> {
        Ok(self.call("purge_expired", || self.backend.purge_expired()).await?)
    }

    fn expires_natively(&self) -> bool {
        self.backend.has_native_ttl()
    }

    #[tracing::instrument(skip_all)]
    async fn sessions_for(&self, principal: &str) -> TicketResult<Vec<Ticket>> {
        // Compare the index value before paying for decryption.
        let definition = self.catalog.definition(TicketKind::TicketGranting);
        let wanted = self.indexed(definition, principal);
        let prefix = format!("{}/", definition.storage_name());
        let entries = self
            .call("get_range", || self.backend.get_range(prefix_range(prefix.as_bytes())))
            .await?;

        let now = self.clock.now();
        Ok(entries
            .iter()
            .filter(|entry| {
                serde_json::from_slice::<Envelope>(&entry.value)
                    .is_ok_and(|e| e.principal.as_deref() == Some(wanted.as_str()))
            })
            .filter_map(|entry| self.open(definition, &entry.value))
            .filter(|t| !t.is_expired(now) && t.principal() == principal)
            .collect())
    }
}
