//! The assembled ticket subsystem.

use std::sync::Arc;

use tessera_storage::StorageBackend;

use crate::{
    backend::Backend,
    catalog::{TicketCatalog, TicketKind},
    cleaner::{CleanerHandle, RegistryCleaner},
    clock::{Clock, SystemClock},
    config::RegistryConfig,
    error::{ConfigError, TicketResult},
    factory::{IssueRequest, TicketFactories},
    id::TicketIdGenerator,
    metrics::RegistryMetrics,
    registry::{StorageTicketRegistry, TicketRegistry, Validation},
    ticket::Ticket,
};

/// Catalog, registry, factories and cleaner wired over one backend.
///
/// Everything is constructed once here and shared; nothing is global.
///
/// ```
/// use std::sync::Arc;
/// use tessera_storage::MemoryBackend;
/// use tessera_tickets::{
///     Authentication, IssueRequest, RegistryConfig, TicketKind, TicketSystem,
/// };
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let system = TicketSystem::builder()
///     .backend(Arc::new(MemoryBackend::new()))
///     .config(&RegistryConfig::default())
///     .build()?;
///
/// let login = IssueRequest::builder()
///     .authentication(Authentication::builder().principal("alice").build())
///     .build();
/// let tgt = system.create(TicketKind::TicketGranting, login).await?;
///
/// let st = system
///     .create(
///         TicketKind::Service,
///         IssueRequest::builder().parent(tgt.id()).service("https://app.example.org").build(),
///     )
///     .await?;
///
/// assert!(system.validate(st.id(), TicketKind::Service).await?.is_valid());
/// assert!(!system.validate(st.id(), TicketKind::Service).await?.is_valid());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct TicketSystem<B = Backend> {
    registry: Arc<StorageTicketRegistry<B>>,
    factories: TicketFactories,
    cleaner: Arc<RegistryCleaner>,
}

#[bon::bon]
impl<B: StorageBackend + 'static> TicketSystem<B> {
    /// Wires the subsystem over `backend`.
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
        let registry = Arc::new(
            StorageTicketRegistry::builder()
                .backend(backend)
                .config(config)
                .clock(Arc::clone(&clock))
                .metrics(metrics.clone())
                .build()?,
        );
        let shared: Arc<dyn TicketRegistry> = registry.clone();

        let factories = TicketFactories::new(
            registry.catalog(),
            Arc::clone(&shared),
            Arc::new(TicketIdGenerator::new(config.id())),
            clock,
            metrics.clone(),
        );
        let cleaner = Arc::new(RegistryCleaner::new(
            shared,
            registry.locks(),
            config.cleaner().clone(),
            metrics,
        ));

        Ok(Self { registry, factories, cleaner })
    }

    /// The registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<StorageTicketRegistry<B>> {
        &self.registry
    }

    /// The per-kind factories.
    #[must_use]
    pub fn factories(&self) -> &TicketFactories {
        &self.factories
    }

    /// The cleaner.
    #[must_use]
    pub fn cleaner(&self) -> &Arc<RegistryCleaner> {
        &self.cleaner
    }

    /// The ticket catalog.
    #[must_use]
    pub fn catalog(&self) -> &TicketCatalog {
        self.registry.catalog()
    }

    /// Lifecycle counters.
    #[must_use]
    pub fn metrics(&self) -> &RegistryMetrics {
        self.registry.metrics()
    }

    /// Issues a ticket. See [`TicketFactory::create`](crate::TicketFactory::create).
    ///
    /// # Errors
    ///
    /// See [`TicketFactory::create`](crate::TicketFactory::create).
    pub async fn create(&self, kind: TicketKind, request: IssueRequest) -> TicketResult<Ticket> {
        self.factories.create(kind, request).await
    }

    /// Presents a ticket. See [`TicketRegistry::validate`].
    ///
    /// # Errors
    ///
    /// Returns an error only when the backend cannot answer.
    pub async fn validate(&self, id: &str, kind: TicketKind) -> TicketResult<Validation> {
        self.registry.validate(id, kind).await
    }

    /// Revokes a ticket. See [`TicketRegistry::delete_ticket`].
    ///
    /// # Errors
    ///
    /// Returns an error only when the backend cannot answer.
    pub async fn revoke(&self, id: &str) -> TicketResult<usize> {
        self.registry.delete_ticket(id).await
    }

    /// Starts the cleaner schedule.
    #[must_use = "dropping the handle stops the cleaner"]
    pub fn start_cleaner(&self) -> CleanerHandle {
        Arc::clone(&self.cleaner).spawn()
    }
}
