//! Ticket issuance.
//!
//! A [`TicketFactory`] issues tickets of one kind: it draws an id with the
//! kind's prefix, attaches the kind's policy, stores the ticket and records
//! it in its parent session's descendant set. [`TicketFactories`] holds one
//! factory per catalog entry.
//!
//! Parent rules:
//!
//! | Kind | Parent | Required fields |
//! |------|--------|-----------------|
//! | TGT | none | `authentication` |
//! | PGT | TGT or PGT | `proxied_by` |
//! | ST | TGT | `service` |
//! | PT | PGT | `service` |
//! | OC, AT, RT | optional TGT | `client_id`, and `authentication` without a parent |

use std::{collections::BTreeMap, collections::BTreeSet, fmt, sync::Arc};

use crate::{
    catalog::{TicketCatalog, TicketDefinition, TicketKind},
    clock::Clock,
    error::{ConfigError, TicketError, TicketResult},
    id::TicketIdGenerator,
    metrics::RegistryMetrics,
    registry::TicketRegistry,
    ticket::{
        Authentication, OAuthGrant, ServiceGrant, SessionGrant, Ticket, TicketPayload, redact_id,
    },
};

/// Parameters of one issuance.
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct IssueRequest {
    /// Id of the granting ticket.
    #[builder(into)]
    pub parent: Option<String>,

    /// Identity of a new session.
    pub authentication: Option<Authentication>,

    /// Target service of a service or proxy ticket.
    #[builder(into)]
    pub service: Option<String>,

    /// OAuth client.
    #[builder(into)]
    pub client_id: Option<String>,

    /// Granted OAuth scopes.
    #[builder(default)]
    pub scopes: BTreeSet<String>,

    /// Whether the parent session was created by this login.
    #[builder(default)]
    pub from_new_login: bool,

    /// Callback receiving a proxy-granting ticket.
    #[builder(into)]
    pub proxied_by: Option<String>,
}

/// Issues tickets of a single kind.
pub struct TicketFactory {
    definition: TicketDefinition,
    ids: Arc<TicketIdGenerator>,
    registry: Arc<dyn TicketRegistry>,
    clock: Arc<dyn Clock>,
    metrics: RegistryMetrics,
}

impl fmt::Debug for TicketFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketFactory").field("definition", &self.definition).finish_non_exhaustive()
    }
}

impl TicketFactory {
    /// The definition tickets are issued under.
    #[must_use]
    pub fn definition(&self) -> &TicketDefinition {
        &self.definition
    }

    /// Issues, stores and registers a ticket.
    ///
    /// # Errors
    ///
    /// - [`TicketError::InvalidRequest`] if a required field is missing
    /// - [`TicketError::InvalidParent`] if the parent is missing, expired or
    ///   of a kind that cannot grant this one
    /// - storage, contention and lock errors from the registry
    #[tracing::instrument(skip_all, fields(kind = %self.definition.kind()))]
    pub async fn create(&self, request: IssueRequest) -> TicketResult<Ticket> {
        let kind = self.definition.kind();
        let parent = self.parent(&request).await?;
        let payload = payload(kind, &request, parent.as_ref())?;

        let id = self.ids.generate(self.definition.prefix());
        let ticket =
            Ticket::new(id, kind, self.clock.now(), self.definition.policy().clone(), payload);
        self.registry.add_ticket(&ticket).await?;

        if let Some(parent) = &parent {
            if let Err(err) = self.registry.attach_descendant(parent.id(), ticket.id()).await {
                tracing::debug!(
                    ticket = %redact_id(ticket.id()),
                    error = %err,
                    "parent update failed, withdrawing ticket",
                );
                if let Err(cleanup) = self.registry.delete_ticket(ticket.id()).await {
                    tracing::warn!(ticket = %redact_id(ticket.id()), error = %cleanup, "failed to withdraw ticket");
                }
                return Err(err);
            }
        }

        self.metrics.record_issued();
        tracing::debug!(ticket = %redact_id(ticket.id()), "issued ticket");
        Ok(ticket)
    }

    async fn parent(&self, request: &IssueRequest) -> TicketResult<Option<Ticket>> {
        let kind = self.definition.kind();
        let Some(parent_id) = request.parent.as_deref() else {
            return match kind {
                TicketKind::TicketGranting
                | TicketKind::OAuthCode
                | TicketKind::AccessToken
                | TicketKind::RefreshToken => Ok(None),
                _ => Err(TicketError::invalid_request(format!("{kind} requires a parent ticket"))),
            };
        };

        let allowed: &[TicketKind] = match kind {
            TicketKind::TicketGranting => {
                return Err(TicketError::invalid_request("ticket_granting takes no parent"));
            },
            TicketKind::ProxyGranting => &[TicketKind::TicketGranting, TicketKind::ProxyGranting],
            TicketKind::Service => &[TicketKind::TicketGranting],
            TicketKind::Proxy => &[TicketKind::ProxyGranting],
            TicketKind::OAuthCode | TicketKind::AccessToken | TicketKind::RefreshToken => {
                &[TicketKind::TicketGranting]
            },
        };

        let parent = self
            .registry
            .get_ticket(parent_id, None)
            .await?
            .ok_or_else(|| TicketError::invalid_parent(redact_id(parent_id), "missing or expired"))?;
        if !allowed.contains(&parent.kind()) {
            return Err(TicketError::invalid_parent(
                redact_id(parent_id),
                format!("a {} cannot grant a {kind}", parent.kind()),
            ));
        }
        Ok(Some(parent))
    }
}

fn required<'a>(value: Option<&'a str>, field: &str, kind: TicketKind) -> TicketResult<&'a str> {
    value.ok_or_else(|| TicketError::invalid_request(format!("{kind} requires `{field}`")))
}

fn payload(
    kind: TicketKind,
    request: &IssueRequest,
    parent: Option<&Ticket>,
) -> TicketResult<TicketPayload> {
    let inherited = || parent.and_then(Ticket::session).map(|s| s.authentication.clone());

    match kind {
        TicketKind::TicketGranting => {
            let authentication = request.authentication.clone().ok_or_else(|| {
                TicketError::invalid_request(format!("{kind} requires `authentication`"))
            })?;
            Ok(TicketPayload::Session(SessionGrant {
                authentication,
                parent: None,
                proxied_by: None,
                descendants: BTreeSet::new(),
            }))
        },
        TicketKind::ProxyGranting => {
            let proxied_by = required(request.proxied_by.as_deref(), "proxied_by", kind)?;
            let authentication = inherited()
                .ok_or_else(|| TicketError::invalid_request(format!("{kind} requires a session parent")))?;
            Ok(TicketPayload::Session(SessionGrant {
                authentication,
                parent: parent.map(|p| p.id().to_owned()),
                proxied_by: Some(proxied_by.to_owned()),
                descendants: BTreeSet::new(),
            }))
        },
        TicketKind::Service | TicketKind::Proxy => {
            let service = required(request.service.as_deref(), "service", kind)?;
            let parent = parent
                .ok_or_else(|| TicketError::invalid_request(format!("{kind} requires a parent ticket")))?;
            let proxy_chain = parent
                .session()
                .and_then(|s| s.proxied_by.clone())
                .into_iter()
                .collect();
            Ok(TicketPayload::Service(ServiceGrant {
                session: parent.id().to_owned(),
                service: service.to_owned(),
                principal: parent.principal().to_owned(),
                from_new_login: request.from_new_login,
                proxy_chain,
            }))
        },
        TicketKind::OAuthCode | TicketKind::AccessToken | TicketKind::RefreshToken => {
            let client_id = required(request.client_id.as_deref(), "client_id", kind)?;
            let principal = match (parent, &request.authentication) {
                (Some(parent), _) => parent.principal().to_owned(),
                (None, Some(authentication)) => authentication.principal.clone(),
                (None, None) => {
                    return Err(TicketError::invalid_request(format!(
                        "{kind} requires a parent or `authentication`"
                    )));
                },
            };
            Ok(TicketPayload::OAuth(OAuthGrant {
                session: parent.map(|p| p.id().to_owned()),
                client_id: client_id.to_owned(),
                principal,
                scopes: request.scopes.clone(),
            }))
        },
    }
}

/// One [`TicketFactory`] per catalog entry.
#[derive(Debug)]
pub struct TicketFactories {
    factories: BTreeMap<TicketKind, TicketFactory>,
}

impl TicketFactories {
    /// Builds a factory for every kind in `catalog`.
    #[must_use]
    pub fn new(
        catalog: &TicketCatalog,
        registry: Arc<dyn TicketRegistry>,
        ids: Arc<TicketIdGenerator>,
        clock: Arc<dyn Clock>,
        metrics: RegistryMetrics,
    ) -> Self {
        let factories = catalog
            .definitions()
            .map(|definition| {
                let factory = TicketFactory {
                    definition: definition.clone(),
                    ids: Arc::clone(&ids),
                    registry: Arc::clone(&registry),
                    clock: Arc::clone(&clock),
                    metrics: metrics.clone(),
                };
                (definition.kind(), factory)
            })
            .collect();
        Self { factories }
    }

    /// The factory for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownTicketKind`] if the catalog has no
    /// entry for `kind`.
    pub fn get(&self, kind: TicketKind) -> Result<&TicketFactory, ConfigError> {
        self.factories
            .get(&kind)
            .ok_or_else(|| ConfigError::UnknownTicketKind { name: kind.name().to_owned() })
    }

    /// The factory for a kind given by its configuration name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownTicketKind`] for an unknown name.
    pub fn by_name(&self, name: &str) -> Result<&TicketFactory, ConfigError> {
        self.get(name.parse()?)
    }

    /// Issues a ticket of `kind`. See [`TicketFactory::create`].
    ///
    /// # Errors
    ///
    /// See [`TicketFactory::create`].
    pub async fn create(&self, kind: TicketKind, request: IssueRequest) -> TicketResult<Ticket> {
        self.get(kind)?.create(request).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use tessera_storage::MemoryBackend;

    use super::*;
    use crate::{
        clock::ManualClock, config::RegistryConfig, id::IdConfig, registry::StorageTicketRegistry,
    };

    fn factories() -> (TicketFactories, Arc<dyn TicketRegistry>) {
        let config = RegistryConfig::default();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let registry: Arc<dyn TicketRegistry> = Arc::new(
            StorageTicketRegistry::builder()
                .backend(Arc::new(MemoryBackend::without_sweeper()))
                .config(&config)
                .clock(Arc::clone(&clock))
                .build()
                .unwrap(),
        );
        let factories = TicketFactories::new(
            &config.catalog().unwrap(),
            Arc::clone(&registry),
            Arc::new(TicketIdGenerator::new(&IdConfig::default())),
            clock,
            RegistryMetrics::new(),
        );
        (factories, registry)
    }

    fn login(principal: &str) -> IssueRequest {
        IssueRequest::builder()
            .authentication(Authentication::builder().principal(principal).build())
            .build()
    }

    #[tokio::test]
    async fn service_ticket_is_recorded_in_its_session() {
        let (factories, registry) = factories();
        let tgt = factories.create(TicketKind::TicketGranting, login("alice")).await.unwrap();
        let st = factories
            .create(
                TicketKind::Service,
                IssueRequest::builder().parent(tgt.id()).service("https://app.example.org").build(),
            )
            .await
            .unwrap();

        assert!(st.id().starts_with("ST-"));
        assert_eq!(st.principal(), "alice");
        assert_eq!(st.parent_id(), Some(tgt.id()));

        let parent = registry.get_ticket(tgt.id(), None).await.unwrap().unwrap();
        assert_eq!(parent.descendants().collect::<Vec<_>>(), vec![st.id()]);
        assert_eq!(parent.state().count_of_uses(), 1);
    }

    #[tokio::test]
    async fn missing_parent_is_rejected_without_storing() {
        let (factories, registry) = factories();
        let err = factories
            .create(
                TicketKind::Service,
                IssueRequest::builder().parent("TGT-9-gone").service("https://app").build(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TicketError::InvalidParent { .. }));
        assert_eq!(registry.service_ticket_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn proxy_ticket_needs_a_proxy_granting_parent() {
        let (factories, _) = factories();
        let tgt = factories.create(TicketKind::TicketGranting, login("alice")).await.unwrap();

        let err = factories
            .create(
                TicketKind::Proxy,
                IssueRequest::builder().parent(tgt.id()).service("https://backend").build(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::InvalidParent { .. }));

        let pgt = factories
            .create(
                TicketKind::ProxyGranting,
                IssueRequest::builder().parent(tgt.id()).proxied_by("https://proxy/cb").build(),
            )
            .await
            .unwrap();
        let pt = factories
            .create(
                TicketKind::Proxy,
                IssueRequest::builder().parent(pgt.id()).service("https://backend").build(),
            )
            .await
            .unwrap();

        match pt.payload() {
            TicketPayload::Service(grant) => {
                assert_eq!(grant.proxy_chain, vec!["https://proxy/cb".to_owned()]);
                assert_eq!(grant.principal, "alice");
            },
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_fields_are_invalid_requests() {
        let (factories, _) = factories();
        let err = factories
            .create(TicketKind::TicketGranting, IssueRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::InvalidRequest { .. }));

        let err = factories
            .create(TicketKind::AccessToken, login("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn oauth_tokens_without_session_use_the_login() {
        let (factories, _) = factories();
        let token = factories
            .create(
                TicketKind::AccessToken,
                IssueRequest::builder()
                    .authentication(Authentication::builder().principal("svc-account").build())
                    .client_id("client-1")
                    .build(),
            )
            .await
            .unwrap();
        assert_eq!(token.principal(), "svc-account");
        assert_eq!(token.parent_id(), None);
    }

    #[test]
    fn lookup_by_name() {
        let (factories, _) = factories();
        assert_eq!(factories.by_name("service").unwrap().definition().prefix(), "ST");
        assert!(matches!(
            factories.by_name("saml_artifact"),
            Err(ConfigError::UnknownTicketKind { .. })
        ));
    }
}
