//! Storage error types and result alias.
//!
//! Every backend maps its native failures onto [`StorageError`]. Callers
//! branch on the variant (or on [`StorageError::is_transient`]) to decide
//! whether an operation may be retried.
//!
//! # Error Types
//!
//! - [`StorageError::NotFound`] - Key does not exist
//! - [`StorageError::Conflict`] - Compare-and-set precondition failed
//! - [`StorageError::Connection`] - Backend unreachable (transient)
//! - [`StorageError::Serialization`] - Value could not be encoded or decoded
//! - [`StorageError::Internal`] - Backend-specific failure
//! - [`StorageError::Timeout`] - Deadline elapsed (transient)
//! - [`StorageError::CasRetriesExhausted`] - Optimistic retries gave up
//!
//! # Example
//!
//! ```
//! use tessera_storage::{StorageError, StorageResult};
//!
//! fn lookup(key: &str) -> StorageResult<Vec<u8>> {
//!     Err(StorageError::not_found(key))
//! }
//!
//! assert!(!lookup("missing").unwrap_err().is_transient());
//! ```

use std::{fmt, sync::Arc};

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// What a retry loop was doing when its overall deadline fired.
///
/// Attached to [`StorageError::Timeout`] by
/// [`with_retry_timeout`](crate::retry::with_retry_timeout) so operators can
/// tell a deadline that is too short for the retry budget apart from a
/// backend that is simply slow.
#[derive(Debug, Default)]
pub struct TimeoutContext {
    /// Attempts that returned (successfully or not) before the deadline.
    pub attempts_completed: u32,
    /// Whether the deadline fired during a backoff sleep.
    pub during_backoff: bool,
    /// The last backend error observed, if any.
    pub last_error: Option<Box<StorageError>>,
}

impl fmt::Display for TimeoutContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "after {} attempt(s)", self.attempts_completed)?;
        if self.during_backoff {
            write!(f, " while backing off")?;
        }
        if let Some(last) = &self.last_error {
            write!(f, ", last error: {last}")?;
        }
        Ok(())
    }
}

/// Errors that can occur during storage operations.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases. Downstream match
/// expressions must include a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The requested key was not found.
    #[error("Key not found: {key}")]
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// A compare-and-set or compare-and-delete precondition did not hold.
    ///
    /// The stored value changed (or appeared, or vanished) between the
    /// caller's read and its conditional write.
    #[error("Conflict")]
    Conflict,

    /// Connection or network error.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// Serialization or deserialization error.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// Internal storage backend error.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// The operation did not complete before its deadline.
    #[error("Operation timeout{}", .context.as_ref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Timeout {
        /// Retry state at the moment the deadline fired, when known.
        context: Option<Box<TimeoutContext>>,
    },

    /// A read-modify-write cycle kept losing compare-and-set races.
    #[error("Compare-and-set retries exhausted after {attempts} attempts")]
    CasRetriesExhausted {
        /// Total attempts made, including the first.
        attempts: u32,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error for the given key.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new `Conflict` error.
    #[must_use]
    pub fn conflict() -> Self {
        Self::Conflict
    }

    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Timeout` error without retry context.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout { context: None }
    }

    /// Creates a new `Timeout` error carrying the retry loop's state.
    #[must_use]
    pub fn timeout_with_context(context: TimeoutContext) -> Self {
        Self::Timeout { context: Some(Box::new(context)) }
    }

    /// Creates a new `CasRetriesExhausted` error.
    #[must_use]
    pub fn cas_retries_exhausted(attempts: u32) -> Self {
        Self::CasRetriesExhausted { attempts }
    }

    /// Returns `true` for failures that may succeed when retried.
    ///
    /// Only connection failures and timeouts qualify. Conflicts are not
    /// transient in this sense: they need a fresh read, not a replay.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Returns a short, allocation-owning description for logs and
    /// timeout context.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Connection { message, .. }
            | Self::Serialization { message, .. }
            | Self::Internal { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Errors raised when validating configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric field is below its allowed minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// Smallest accepted value.
        min: String,
        /// The rejected value.
        value: String,
    },

    /// A duration or count must be strictly positive.
    #[error("{field} must be positive, got {value}")]
    MustBePositive {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value.
        value: String,
    },

    /// Two related fields are inconsistent with each other.
    #[error("{field} is invalid: {reason}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StorageError::connection("refused").is_transient());
        assert!(StorageError::timeout().is_transient());
        assert!(!StorageError::conflict().is_transient());
        assert!(!StorageError::not_found("k").is_transient());
        assert!(!StorageError::cas_retries_exhausted(3).is_transient());
    }

    #[test]
    fn timeout_display_includes_context() {
        let err = StorageError::timeout_with_context(TimeoutContext {
            attempts_completed: 2,
            during_backoff: true,
            last_error: Some(Box::new(StorageError::connection("reset"))),
        });
        let rendered = err.to_string();
        assert!(rendered.contains("after 2 attempt(s)"), "{rendered}");
        assert!(rendered.contains("backing off"), "{rendered}");
        assert!(rendered.contains("reset"), "{rendered}");
    }

    #[test]
    fn source_chain_is_preserved() {
        let io = std::io::Error::other("socket closed");
        let err = StorageError::connection_with_source("pool", io);
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "socket closed");
    }
}
