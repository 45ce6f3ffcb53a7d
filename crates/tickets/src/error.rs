//! Ticket subsystem error types.
//!
//! Outcomes a caller is expected to branch on (not found, expired, already
//! consumed, throttled) are [`Validation`](crate::Validation) values, not
//! errors. [`TicketError`] is reserved for failures: the backend could not
//! answer, a request was malformed, or the configuration is unusable.

use tessera_storage::StorageError;
use thiserror::Error;

/// Result alias for ticket operations.
pub type TicketResult<T> = Result<T, TicketError>;

/// Errors returned by the registry, factories and cleaner.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases. Downstream match
/// expressions must include a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TicketError {
    /// The backend failed transiently and retries were exhausted, or the
    /// operation missed its deadline. Never reported as "not found".
    #[error("ticket backend unavailable: {source}")]
    BackendUnavailable {
        /// The last storage error.
        #[source]
        source: StorageError,
    },

    /// The backend rejected the operation for a non-transient reason.
    #[error("ticket storage error: {source}")]
    Storage {
        /// The underlying storage error.
        #[source]
        source: StorageError,
    },

    /// Optimistic retries on a ticket were exhausted.
    #[error("contention on ticket {id}: retries exhausted")]
    Contention {
        /// Redacted ticket id.
        id: String,
    },

    /// A pessimistic lock could not be acquired in time.
    #[error("timed out waiting for lock {resource}")]
    LockTimeout {
        /// Name of the contended lock.
        resource: String,
    },

    /// The parent named at issuance is missing, expired or of the wrong kind.
    #[error("invalid parent ticket {id}: {reason}")]
    InvalidParent {
        /// Redacted parent id.
        id: String,
        /// Why the parent was rejected.
        reason: String,
    },

    /// A construction parameter was missing or malformed.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Description of the problem.
        message: String,
    },

    /// A ticket could not be serialized.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
    },

    /// The cipher failed to encode a payload.
    #[error("cipher error: {message}")]
    Cipher {
        /// Description of the failure.
        message: String,
    },

    /// The configuration is unusable.
    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

impl TicketError {
    /// Creates an [`InvalidParent`](Self::InvalidParent) error.
    #[must_use]
    pub fn invalid_parent(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParent { id: id.into(), reason: reason.into() }
    }

    /// Creates an [`InvalidRequest`](Self::InvalidRequest) error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    /// Creates a [`Serialization`](Self::Serialization) error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into() }
    }

    /// Creates a [`Cipher`](Self::Cipher) error.
    #[must_use]
    pub fn cipher(message: impl Into<String>) -> Self {
        Self::Cipher { message: message.into() }
    }

    /// Creates a [`Contention`](Self::Contention) error.
    #[must_use]
    pub fn contention(id: impl Into<String>) -> Self {
        Self::Contention { id: id.into() }
    }

    /// Creates a [`LockTimeout`](Self::LockTimeout) error.
    #[must_use]
    pub fn lock_timeout(resource: impl Into<String>) -> Self {
        Self::LockTimeout { resource: resource.into() }
    }

    /// Returns `true` if the backend could not be reached.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
}

impl From<StorageError> for TicketError {
    fn from(source: StorageError) -> Self {
        if source.is_transient() {
            Self::BackendUnavailable { source }
        } else {
            Self::Storage { source }
        }
    }
}

/// Errors detected while validating ticket configuration at startup.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A per-kind override names a kind the catalog does not know.
    #[error("unknown ticket kind {name:?}")]
    UnknownTicketKind {
        /// The rejected name.
        name: String,
    },

    /// The cipher is enabled but a key is missing.
    #[error("cipher is enabled but {key} is not set")]
    MissingCipherKey {
        /// Which key is missing.
        key: &'static str,
    },

    /// A cipher key is present but unusable.
    #[error("{key} is invalid: {reason}")]
    InvalidCipherKey {
        /// Which key was rejected.
        key: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// A prefix is malformed or used by two kinds.
    #[error("invalid ticket prefix {prefix:?}: {reason}")]
    InvalidPrefix {
        /// The rejected prefix.
        prefix: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A storage name is malformed or used by two kinds.
    #[error("invalid storage name {name:?}: {reason}")]
    InvalidStorageName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An expiration policy cannot be honoured.
    #[error("invalid expiration policy for {kind}: {reason}")]
    InvalidPolicy {
        /// Kind the policy was configured for.
        kind: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The lock settings are inconsistent.
    #[error("invalid lock mode: {reason}")]
    InvalidLockMode {
        /// Why the settings were rejected.
        reason: String,
    },

    /// The replicated backend was selected without a message bus.
    #[error("replicated backend requires a message bus")]
    MissingMessageBus,

    /// A numeric setting is out of range.
    #[error(transparent)]
    Storage(#[from] tessera_storage::ConfigError),
}
