//! The ticket registry contract.
//!
//! [`TicketRegistry`] is the single capability every caller goes through:
//! issuance writes, lookups, validation, revocation and the queries the
//! cleaner and administrative tooling need. [`StorageTicketRegistry`] is
//! the implementation over any [`StorageBackend`](tessera_storage::StorageBackend);
//! which backend is used is a configuration choice, see
//! [`Backend`](crate::Backend).

mod storage;

use async_trait::async_trait;

pub use self::storage::StorageTicketRegistry;
use crate::{
    catalog::TicketKind,
    error::TicketResult,
    ticket::Ticket,
};

/// Predicate used to filter enumerations.
pub type TicketFilter<'a> = &'a (dyn Fn(&Ticket) -> bool + Send + Sync);

/// Outcome of presenting a ticket.
///
/// Only [`Valid`](Self::Valid) grants access. Callers outside the subsystem
/// should treat every other variant as "not found"; the distinction exists
/// for metrics and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Validation {
    /// The ticket was accepted; carries its state after this use.
    Valid(Ticket),
    /// Unknown id, wrong kind, or a record that failed verification.
    NotFound,
    /// The policy says the ticket is expired.
    Expired,
    /// A single-use ticket presented again after consumption.
    AlreadyConsumed,
    /// The use came too soon after the previous one.
    Throttled,
}

impl Validation {
    /// Returns `true` for [`Valid`](Self::Valid).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// The validated ticket, if any.
    #[must_use]
    pub fn ticket(&self) -> Option<&Ticket> {
        match self {
            Self::Valid(ticket) => Some(ticket),
            _ => None,
        }
    }

    /// Consumes the outcome, returning the validated ticket.
    #[must_use]
    pub fn into_ticket(self) -> Option<Ticket> {
        match self {
            Self::Valid(ticket) => Some(ticket),
            _ => None,
        }
    }
}

/// Storage and lifecycle operations on tickets.
///
/// Every method is bounded by the configured operation deadline. A
/// backend that cannot answer yields
/// [`TicketError::BackendUnavailable`](crate::TicketError::BackendUnavailable),
/// never "not found".
#[async_trait]
pub trait TicketRegistry: Send + Sync {
    /// Stores a ticket. An existing ticket with the same id is replaced.
    async fn add_ticket(&self, ticket: &Ticket) -> TicketResult<()>;

    /// Looks a ticket up. Unknown, expired, undecodable or mistyped
    /// tickets are `None`.
    async fn get_ticket(&self, id: &str, expected: Option<TicketKind>)
    -> TicketResult<Option<Ticket>>;

    /// Replaces the stored copy of a ticket.
    async fn update_ticket(&self, ticket: &Ticket) -> TicketResult<()>;

    /// Deletes a ticket, and its descendants when cascading is enabled.
    /// Returns how many records were removed.
    async fn delete_ticket(&self, id: &str) -> TicketResult<usize>;

    /// Deletes every ticket of every kind. Returns how many were removed.
    async fn delete_all(&self) -> TicketResult<usize>;

    /// Live tickets of `kind` accepted by `filter`, in storage order.
    async fn get_tickets(&self, kind: TicketKind, filter: TicketFilter<'_>)
    -> TicketResult<Vec<Ticket>>;

    /// Up to `limit` stored tickets of `kind` whose policy says expired.
    async fn expired_tickets(&self, kind: TicketKind, limit: usize) -> TicketResult<Vec<Ticket>>;

    /// Presents a ticket: lookup, policy check, usage update and, for a
    /// use that spends the ticket, atomic removal.
    ///
    /// Of any number of concurrent validations of a single-use ticket,
    /// exactly one returns [`Validation::Valid`].
    async fn validate(&self, id: &str, kind: TicketKind) -> TicketResult<Validation>;

    /// Records `child_id` in the descendant set of session `parent_id` and
    /// refreshes the parent's usage, honouring the configured lock mode.
    /// Returns the updated parent.
    async fn attach_descendant(&self, parent_id: &str, child_id: &str) -> TicketResult<Ticket>;

    /// Physically removes records whose storage TTL elapsed.
    async fn purge_expired(&self) -> TicketResult<usize>;

    /// Whether the backend evicts expired records by itself.
    fn expires_natively(&self) -> bool;

    /// Every live ticket of every kind.
    async fn all_tickets(&self) -> TicketResult<Vec<Ticket>> {
        let mut tickets = Vec::new();
        for kind in TicketKind::ALL {
            tickets.extend(self.get_tickets(kind, &|_| true).await?);
        }
        Ok(tickets)
    }

    /// Number of live ticket-granting tickets.
    async fn session_count(&self) -> TicketResult<usize> {
        Ok(self.get_tickets(TicketKind::TicketGranting, &|_| true).await?.len())
    }

    /// Number of live service and proxy tickets.
    async fn service_ticket_count(&self) -> TicketResult<usize> {
        let services = self.get_tickets(TicketKind::Service, &|_| true).await?.len();
        let proxies = self.get_tickets(TicketKind::Proxy, &|_| true).await?.len();
        Ok(services + proxies)
    }

    /// Live ticket-granting tickets of `principal`.
    async fn sessions_for(&self, principal: &str) -> TicketResult<Vec<Ticket>> {
        self.get_tickets(TicketKind::TicketGranting, &|t| t.principal() == principal).await
    }

    /// Number of live ticket-granting tickets of `principal`.
    async fn count_sessions_for(&self, principal: &str) -> TicketResult<usize> {
        Ok(self.sessions_for(principal).await?.len())
    }

    /// Number of live service and proxy tickets issued for `service`.
    async fn count_tickets_for(&self, service: &str) -> TicketResult<usize> {
        let matches = |t: &Ticket| t.service() == Some(service);
        let services = self.get_tickets(TicketKind::Service, &matches).await?.len();
        let proxies = self.get_tickets(TicketKind::Proxy, &matches).await?.len();
        Ok(services + proxies)
    }
}
