//! Ticket records.
//!
//! A [`Ticket`] is a base record (id, kind, usage state, policy) plus a
//! kind-specific [`TicketPayload`]. Usage only changes through
//! [`TicketState::update`], which returns a new state.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{catalog::TicketKind, expiration::ExpirationPolicy};

/// Usage counters of a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TicketState {
    created_at: DateTime<Utc>,
    count_of_uses: u32,
    last_time_used: DateTime<Utc>,
    previous_time_used: Option<DateTime<Utc>>,
}

impl TicketState {
    /// State of a ticket created at `created_at` and never used.
    #[must_use]
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self { created_at, count_of_uses: 0, last_time_used: created_at, previous_time_used: None }
    }

    /// State after one more use at `now`.
    #[must_use]
    pub fn update(&self, now: DateTime<Utc>) -> Self {
        Self {
            created_at: self.created_at,
            count_of_uses: self.count_of_uses.saturating_add(1),
            last_time_used: now,
            previous_time_used: Some(self.last_time_used),
        }
    }

    /// When the ticket was created.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// How many times the ticket has been used.
    #[must_use]
    pub fn count_of_uses(&self) -> u32 {
        self.count_of_uses
    }

    /// Time of the latest use, or creation if never used.
    #[must_use]
    pub fn last_time_used(&self) -> DateTime<Utc> {
        self.last_time_used
    }

    /// Time of the use before the latest one.
    #[must_use]
    pub fn previous_time_used(&self) -> Option<DateTime<Utc>> {
        self.previous_time_used
    }
}

/// The authenticated identity behind a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct Authentication {
    /// Principal identifier.
    #[builder(into)]
    pub principal: String,

    /// Released principal attributes.
    #[serde(default)]
    #[builder(default)]
    pub attributes: BTreeMap<String, Vec<String>>,

    /// When the principal authenticated.
    #[builder(default = Utc::now())]
    pub authenticated_at: DateTime<Utc>,
}

/// Payload of a session-granting ticket (TGT, PGT).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionGrant {
    /// Who the session belongs to.
    pub authentication: Authentication,

    /// Granting ticket this one was derived from, for proxy sessions.
    #[serde(default)]
    pub parent: Option<String>,

    /// Callback that received this proxy-granting ticket.
    #[serde(default)]
    pub proxied_by: Option<String>,

    /// Tickets issued against this session.
    #[serde(default)]
    pub descendants: BTreeSet<String>,
}

/// Payload of a per-application ticket (ST, PT).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceGrant {
    /// Granting ticket that issued this one.
    pub session: String,

    /// Service the ticket is valid for.
    pub service: String,

    /// Principal copied from the granting session.
    pub principal: String,

    /// Whether the session was created by the login that issued this ticket.
    #[serde(default)]
    pub from_new_login: bool,

    /// Proxying services, nearest first. Empty for direct service tickets.
    #[serde(default)]
    pub proxy_chain: Vec<String>,
}

/// Payload of an OAuth code or token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthGrant {
    /// Granting ticket, when issued from a browser session.
    #[serde(default)]
    pub session: Option<String>,

    /// Client the grant belongs to.
    pub client_id: String,

    /// Resource owner.
    pub principal: String,

    /// Granted scopes.
    #[serde(default)]
    pub scopes: BTreeSet<String>,
}

/// Kind-specific ticket data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TicketPayload {
    /// TGT and PGT.
    Session(SessionGrant),
    /// ST and PT.
    Service(ServiceGrant),
    /// OAuth codes and tokens.
    #[serde(rename = "oauth")]
    OAuth(OAuthGrant),
}

/// A ticket as stored in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ticket {
    pub(crate) id: String,
    pub(crate) kind: TicketKind,
    pub(crate) state: TicketState,
    pub(crate) policy: ExpirationPolicy,
    pub(crate) payload: TicketPayload,
}

impl Ticket {
    /// Assembles a new, unused ticket.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        kind: TicketKind,
        created_at: DateTime<Utc>,
        policy: ExpirationPolicy,
        payload: TicketPayload,
    ) -> Self {
        Self { id: id.into(), kind, state: TicketState::new(created_at), policy, payload }
    }

    /// The ticket id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The ticket kind.
    #[must_use]
    pub fn kind(&self) -> TicketKind {
        self.kind
    }

    /// Usage state.
    #[must_use]
    pub fn state(&self) -> &TicketState {
        &self.state
    }

    /// Expiration policy.
    #[must_use]
    pub fn policy(&self) -> &ExpirationPolicy {
        &self.policy
    }

    /// Kind-specific data.
    #[must_use]
    pub fn payload(&self) -> &TicketPayload {
        &self.payload
    }

    /// Creation time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.state.created_at()
    }

    /// Evaluates the policy at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.policy.is_expired(&self.state, now)
    }

    /// When the ticket expires if left unused.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.policy.expires_at(&self.state)
    }

    /// Returns a copy with one more use recorded at `now`.
    #[must_use]
    pub fn used_at(&self, now: DateTime<Utc>) -> Self {
        Self { state: self.state.update(now), ..self.clone() }
    }

    /// The principal this ticket speaks for.
    #[must_use]
    pub fn principal(&self) -> &str {
        match &self.payload {
            TicketPayload::Session(grant) => &grant.authentication.principal,
            TicketPayload::Service(grant) => &grant.principal,
            TicketPayload::OAuth(grant) => &grant.principal,
        }
    }

    /// The target service of a per-application ticket.
    #[must_use]
    pub fn service(&self) -> Option<&str> {
        match &self.payload {
            TicketPayload::Service(grant) => Some(&grant.service),
            _ => None,
        }
    }

    /// Id of the ticket this one was issued from.
    #[must_use]
    pub fn parent_id(&self) -> Option<&str> {
        match &self.payload {
            TicketPayload::Session(grant) => grant.parent.as_deref(),
            TicketPayload::Service(grant) => Some(&grant.session),
            TicketPayload::OAuth(grant) => grant.session.as_deref(),
        }
    }

    /// Session data, for session-granting tickets.
    #[must_use]
    pub fn session(&self) -> Option<&SessionGrant> {
        match &self.payload {
            TicketPayload::Session(grant) => Some(grant),
            _ => None,
        }
    }

    /// Ids issued against this session. Empty for other kinds.
    pub fn descendants(&self) -> impl Iterator<Item = &str> {
        self.session().into_iter().flat_map(|grant| grant.descendants.iter().map(String::as_str))
    }

    /// Records a descendant. Returns `false` for non-session tickets.
    pub(crate) fn add_descendant(&mut self, id: &str) -> bool {
        match &mut self.payload {
            TicketPayload::Session(grant) => {
                grant.descendants.insert(id.to_owned());
                true
            },
            _ => false,
        }
    }
}

/// Renders a ticket id for logs: the prefix and a short digest.
///
/// ```
/// let redacted = tessera_tickets::redact_id("TGT-1-c2VjcmV0");
/// assert!(redacted.starts_with("TGT-…"));
/// assert!(!redacted.contains("c2VjcmV0"));
/// ```
#[must_use]
pub fn redact_id(id: &str) -> String {
    let prefix = id.split('-').next().unwrap_or_default();
    let digest = Sha256::digest(id.as_bytes());
    format!("{prefix}-…{}", hex::encode(&digest[..3]))
}
