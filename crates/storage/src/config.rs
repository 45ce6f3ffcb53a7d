//! Retry configuration shared by every backend consumer.
//!
//! Two policies are configured here:
//!
//! - [`RetryConfig`] bounds how often a transient failure (connection loss, timeout) is replayed
//!   before it is surfaced.
//! - [`CasRetryConfig`] bounds how often a read-modify-write cycle is restarted after losing a
//!   compare-and-set race.
//!
//! Both deserialize from human-readable durations (`"100ms"`, `"2s"`) and
//! expose a validating `bon` builder for programmatic construction.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default first backoff delay.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Default ceiling on a single backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Default number of CAS restarts after the first attempt.
pub const DEFAULT_CAS_MAX_RETRIES: u32 = 8;

/// Default base delay between CAS restarts (jitter of up to the same amount is added).
pub const DEFAULT_CAS_BASE_DELAY: Duration = Duration::from_millis(2);

/// Bounded exponential backoff for transient storage failures.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tessera_storage::RetryConfig;
///
/// let config = RetryConfig::builder()
///     .max_retries(5)
///     .initial_backoff(Duration::from_millis(20))
///     .build()?;
/// assert_eq!(config.max_retries(), 5);
/// # Ok::<(), tessera_storage::ConfigError>(())
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first attempt. Zero disables retrying.
    #[serde(default = "default_max_retries")]
    pub(crate) max_retries: u32,

    /// Delay before the first retry; doubles on each subsequent one.
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub(crate) initial_backoff: Duration,

    /// Upper bound for a single backoff delay (before jitter).
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub(crate) max_backoff: Duration,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

#[bon::bon]
impl RetryConfig {
    /// Creates a retry configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - `initial_backoff` is zero
    /// - `max_backoff` is smaller than `initial_backoff`
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_RETRIES)] max_retries: u32,
        #[builder(default = DEFAULT_INITIAL_BACKOFF)] initial_backoff: Duration,
        #[builder(default = DEFAULT_MAX_BACKOFF)] max_backoff: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { max_retries, initial_backoff, max_backoff };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants enforced by the builder.
    ///
    /// Deserialized configurations bypass the builder, so loaders call this
    /// explicitly.
    ///
    /// # Errors
    ///
    /// See [`RetryConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "initial_backoff",
                value: "0s".into(),
            });
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::BelowMinimum {
                field: "max_backoff",
                min: format!("{:?}", self.initial_backoff),
                value: format!("{:?}", self.max_backoff),
            });
        }
        Ok(())
    }

    /// Returns the number of retries after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the first backoff delay.
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Returns the backoff ceiling.
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }
}

/// Jittered restart policy for compare-and-set loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CasRetryConfig {
    /// Restarts after the first attempt.
    #[serde(default = "default_cas_max_retries")]
    pub(crate) max_retries: u32,

    /// Fixed delay between restarts; up to the same amount of jitter is added.
    #[serde(with = "humantime_serde", default = "default_cas_base_delay")]
    pub(crate) base_delay: Duration,
}

fn default_cas_max_retries() -> u32 {
    DEFAULT_CAS_MAX_RETRIES
}

fn default_cas_base_delay() -> Duration {
    DEFAULT_CAS_BASE_DELAY
}

impl Default for CasRetryConfig {
    fn default() -> Self {
        Self { max_retries: DEFAULT_CAS_MAX_RETRIES, base_delay: DEFAULT_CAS_BASE_DELAY }
    }
}

#[bon::bon]
impl CasRetryConfig {
    /// Creates a CAS retry configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if `max_retries` is zero: a
    /// read-modify-write that may never retry loses updates under contention.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_CAS_MAX_RETRIES)] max_retries: u32,
        #[builder(default = DEFAULT_CAS_BASE_DELAY)] base_delay: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { max_retries, base_delay };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants enforced by the builder.
    ///
    /// # Errors
    ///
    /// See [`CasRetryConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "cas_retry.max_retries",
                min: "1".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Returns the number of restarts after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the base delay between restarts.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_match_default_impl() {
        let built = RetryConfig::builder().build().unwrap();
        let default = RetryConfig::default();
        assert_eq!(built.max_retries(), default.max_retries());
        assert_eq!(built.initial_backoff(), default.initial_backoff());
        assert_eq!(built.max_backoff(), default.max_backoff());
    }

    #[test]
    fn zero_initial_backoff_is_rejected() {
        let err = RetryConfig::builder().initial_backoff(Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, ConfigError::MustBePositive { field: "initial_backoff", .. }));
    }

    #[test]
    fn max_below_initial_is_rejected() {
        let err = RetryConfig::builder()
            .initial_backoff(Duration::from_secs(2))
            .max_backoff(Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "max_backoff", .. }));
    }

    #[test]
    fn cas_retry_requires_at_least_one_restart() {
        assert!(CasRetryConfig::builder().max_retries(0).build().is_err());
        assert!(CasRetryConfig::builder().max_retries(1).build().is_ok());
    }

    #[test]
    fn deserializes_humantime_durations_with_defaults() {
        let json = r#"{ "initial_backoff": "20ms" }"#;
        let config: RetryConfig = serde_json::from_str(json).expect("valid json");
        assert_eq!(config.initial_backoff(), Duration::from_millis(20));
        assert_eq!(config.max_retries(), DEFAULT_MAX_RETRIES);
        assert_eq!(config.max_backoff(), DEFAULT_MAX_BACKOFF);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let json = r#"{ "max_attempts": 3 }"#;
        assert!(serde_json::from_str::<RetryConfig>(json).is_err());
    }
}
