//! Registry configuration.
//!
//! [`RegistryConfig`] gathers everything the ticket subsystem reads at
//! startup: per-kind overrides, cipher keys, cleaner schedule, lock mode,
//! deadlines and retry budgets. It deserializes from human-readable
//! durations and is validated once; after that nothing in it changes.
//!
//! ```
//! use tessera_tickets::{LockMode, RegistryConfig};
//!
//! let config: RegistryConfig = serde_json::from_str(r#"{
//!     "lock_mode": "pessimistic_write",
//!     "lock_timeout": "250ms",
//!     "remove_descendants": true,
//!     "cleaner": { "repeat_interval": "30s" },
//!     "tickets": {
//!         "service": { "policy": { "type": "multi_use", "max_uses": 1, "time_to_live": "5s" } }
//!     }
//! }"#)?;
//! config.validate()?;
//! assert_eq!(config.lock_mode(), LockMode::PessimisticWrite);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use tessera_storage::{CasRetryConfig, RetryConfig};

use crate::{
    catalog::{TicketCatalog, TicketOverride},
    cipher::CipherConfig,
    error::ConfigError,
    id::IdConfig,
};

/// Default deadline for one registry operation, retries included.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bounded wait for a pessimistic lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// Default lifetime of a lease lock record.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(30);

/// Default retention of consumed single-use ids.
pub const DEFAULT_CONSUMED_RETENTION: Duration = Duration::from_secs(5 * 60);

/// Default number of consumed ids remembered.
pub const DEFAULT_CONSUMED_CAPACITY: u64 = 100_000;

/// Default delay before the first cleaner sweep.
pub const DEFAULT_CLEANER_START_DELAY: Duration = Duration::from_secs(20);

/// Default interval between cleaner sweeps.
pub const DEFAULT_CLEANER_REPEAT_INTERVAL: Duration = Duration::from_secs(120);

/// Default tickets examined per kind per sweep.
pub const DEFAULT_CLEANER_BATCH_SIZE: usize = 500;

/// How read-modify-write cycles on a parent ticket are coordinated.
///
/// The five modes collapse onto three behaviours:
///
/// | Mode | Behaviour |
/// |------|-----------|
/// | `none` | plain read-modify-write; concurrent issuers may lose updates |
/// | `optimistic`, `optimistic_force_increment` | compare-and-set, restarted with jitter on conflict |
/// | `pessimistic_read`, `pessimistic_write` | exclusive lease lock, bounded by `lock_timeout` |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// No coordination.
    None,
    /// Version check and retry.
    #[default]
    Optimistic,
    /// Version check and retry; the version always moves.
    OptimisticForceIncrement,
    /// Exclusive lease lock.
    PessimisticRead,
    /// Exclusive lease lock.
    PessimisticWrite,
}

/// Effective coordination strategy of a [`LockMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Coordination {
    Unsynchronized,
    Optimistic,
    Pessimistic,
}

impl LockMode {
    pub(crate) fn coordination(self) -> Coordination {
        match self {
            Self::None => Coordination::Unsynchronized,
            Self::Optimistic | Self::OptimisticForceIncrement => Coordination::Optimistic,
            Self::PessimisticRead | Self::PessimisticWrite => Coordination::Pessimistic,
        }
    }
}

/// Schedule and work bound of the registry cleaner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CleanerConfig {
    /// Whether sweeps run at all.
    #[serde(default = "default_true")]
    pub(crate) enabled: bool,

    /// Delay before the first sweep.
    #[serde(with = "humantime_serde", default = "default_cleaner_start_delay")]
    pub(crate) start_delay: Duration,

    /// Interval between sweeps.
    #[serde(with = "humantime_serde", default = "default_cleaner_repeat_interval")]
    pub(crate) repeat_interval: Duration,

    /// Tickets examined per kind per sweep.
    #[serde(default = "default_cleaner_batch_size")]
    pub(crate) batch_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_cleaner_start_delay() -> Duration {
    DEFAULT_CLEANER_START_DELAY
}

fn default_cleaner_repeat_interval() -> Duration {
    DEFAULT_CLEANER_REPEAT_INTERVAL
}

fn default_cleaner_batch_size() -> usize {
    DEFAULT_CLEANER_BATCH_SIZE
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start_delay: DEFAULT_CLEANER_START_DELAY,
            repeat_interval: DEFAULT_CLEANER_REPEAT_INTERVAL,
            batch_size: DEFAULT_CLEANER_BATCH_SIZE,
        }
    }
}

#[bon::bon]
impl CleanerConfig {
    /// Creates a validated cleaner configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `repeat_interval` or `batch_size` is zero.
    #[builder]
    pub fn new(
        #[builder(default = true)] enabled: bool,
        #[builder(default = DEFAULT_CLEANER_START_DELAY)] start_delay: Duration,
        #[builder(default = DEFAULT_CLEANER_REPEAT_INTERVAL)] repeat_interval: Duration,
        #[builder(default = DEFAULT_CLEANER_BATCH_SIZE)] batch_size: usize,
    ) -> Result<Self, ConfigError> {
        let config = Self { enabled, start_delay, repeat_interval, batch_size };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants enforced by the builder.
    ///
    /// # Errors
    ///
    /// See [`CleanerConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repeat_interval.is_zero() {
            return Err(tessera_storage::ConfigError::MustBePositive {
                field: "cleaner.repeat_interval",
                value: "0s".into(),
            }
            .into());
        }
        if self.batch_size == 0 {
            return Err(tessera_storage::ConfigError::MustBePositive {
                field: "cleaner.batch_size",
                value: "0".into(),
            }
            .into());
        }
        Ok(())
    }

    /// Whether sweeps run.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Delay before the first sweep.
    #[must_use]
    pub fn start_delay(&self) -> Duration {
        self.start_delay
    }

    /// Interval between sweeps.
    #[must_use]
    pub fn repeat_interval(&self) -> Duration {
        self.repeat_interval
    }

    /// Tickets examined per kind per sweep.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Startup configuration of the ticket subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Per-kind overrides keyed by kind name.
    #[serde(default)]
    pub(crate) tickets: BTreeMap<String, TicketOverride>,

    #[serde(default)]
    pub(crate) cipher: CipherConfig,

    #[serde(default)]
    pub(crate) cleaner: CleanerConfig,

    #[serde(default)]
    pub(crate) lock_mode: LockMode,

    /// Bounded wait for a pessimistic lock.
    #[serde(with = "humantime_serde", default = "default_lock_timeout")]
    pub(crate) lock_timeout: Duration,

    /// Lifetime of a lease lock record; a crashed holder is taken over
    /// after this long.
    #[serde(with = "humantime_serde", default = "default_lock_lease")]
    pub(crate) lock_lease: Duration,

    /// Deadline for one registry operation, retries included.
    #[serde(with = "humantime_serde", default = "default_operation_timeout")]
    pub(crate) operation_timeout: Duration,

    #[serde(default)]
    pub(crate) retry: RetryConfig,

    #[serde(default)]
    pub(crate) cas_retry: CasRetryConfig,

    /// Whether deleting a session also deletes what it issued.
    #[serde(default)]
    pub(crate) remove_descendants: bool,

    #[serde(default)]
    pub(crate) id: IdConfig,

    /// Name of this node in lock records and replication events.
    #[serde(default = "default_node_id")]
    pub(crate) node_id: String,

    /// How long consumed single-use ids are remembered.
    #[serde(with = "humantime_serde", default = "default_consumed_retention")]
    pub(crate) consumed_retention: Duration,

    /// How many consumed ids are remembered.
    #[serde(default = "default_consumed_capacity")]
    pub(crate) consumed_capacity: u64,
}

fn default_lock_timeout() -> Duration {
    DEFAULT_LOCK_TIMEOUT
}

fn default_lock_lease() -> Duration {
    DEFAULT_LOCK_LEASE
}

fn default_operation_timeout() -> Duration {
    DEFAULT_OPERATION_TIMEOUT
}

fn default_node_id() -> String {
    "node-1".to_owned()
}

fn default_consumed_retention() -> Duration {
    DEFAULT_CONSUMED_RETENTION
}

fn default_consumed_capacity() -> u64 {
    DEFAULT_CONSUMED_CAPACITY
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            tickets: BTreeMap::new(),
            cipher: CipherConfig::default(),
            cleaner: CleanerConfig::default(),
            lock_mode: LockMode::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_lease: DEFAULT_LOCK_LEASE,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            retry: RetryConfig::default(),
            cas_retry: CasRetryConfig::default(),
            remove_descendants: false,
            id: IdConfig::default(),
            node_id: default_node_id(),
            consumed_retention: DEFAULT_CONSUMED_RETENTION,
            consumed_capacity: DEFAULT_CONSUMED_CAPACITY,
        }
    }
}

#[bon::bon]
impl RegistryConfig {
    /// Creates a validated registry configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any section is invalid; see
    /// [`RegistryConfig::validate`].
    #[builder]
    pub fn new(
        #[builder(default)] tickets: BTreeMap<String, TicketOverride>,
        #[builder(default)] cipher: CipherConfig,
        #[builder(default)] cleaner: CleanerConfig,
        #[builder(default)] lock_mode: LockMode,
        #[builder(default = DEFAULT_LOCK_TIMEOUT)] lock_timeout: Duration,
        #[builder(default = DEFAULT_LOCK_LEASE)] lock_lease: Duration,
        #[builder(default = DEFAULT_OPERATION_TIMEOUT)] operation_timeout: Duration,
        #[builder(default)] retry: RetryConfig,
        #[builder(default)] cas_retry: CasRetryConfig,
        #[builder(default)] remove_descendants: bool,
        #[builder(default)] id: IdConfig,
        #[builder(into, default = default_node_id())] node_id: String,
        #[builder(default = DEFAULT_CONSUMED_RETENTION)] consumed_retention: Duration,
        #[builder(default = DEFAULT_CONSUMED_CAPACITY)] consumed_capacity: u64,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            tickets,
            cipher,
            cleaner,
            lock_mode,
            lock_timeout,
            lock_lease,
            operation_timeout,
            retry,
            cas_retry,
            remove_descendants,
            id,
            node_id,
            consumed_retention,
            consumed_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates every section, including the ticket catalog and the
    /// cipher keys.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found:
    /// - an unknown kind name or an invalid per-kind override
    /// - an enabled cipher with missing or malformed keys
    /// - a pessimistic lock mode with a zero `lock_timeout`
    /// - a zero `operation_timeout` or `lock_lease`
    /// - an empty `node_id`
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.catalog()?;
        self.cipher.validate()?;
        self.cleaner.validate()?;
        self.retry.validate()?;
        self.cas_retry.validate()?;
        self.id.validate()?;

        if self.lock_mode.coordination() == Coordination::Pessimistic && self.lock_timeout.is_zero()
        {
            return Err(ConfigError::InvalidLockMode {
                reason: format!("{:?} requires a positive lock_timeout", self.lock_mode),
            });
        }
        if self.operation_timeout.is_zero() {
            return Err(tessera_storage::ConfigError::MustBePositive {
                field: "operation_timeout",
                value: "0s".into(),
            }
            .into());
        }
        if self.lock_lease.is_zero() {
            return Err(tessera_storage::ConfigError::MustBePositive {
                field: "lock_lease",
                value: "0s".into(),
            }
            .into());
        }
        if self.node_id.is_empty() {
            return Err(tessera_storage::ConfigError::Invalid {
                field: "node_id",
                reason: "must not be empty".into(),
            }
            .into());
        }
        Ok(())
    }

    /// Builds the ticket catalog from the per-kind overrides.
    ///
    /// # Errors
    ///
    /// See [`TicketCatalog::from_overrides`].
    pub fn catalog(&self) -> Result<TicketCatalog, ConfigError> {
        TicketCatalog::from_overrides(&self.tickets)
    }

    /// Cipher settings.
    #[must_use]
    pub fn cipher(&self) -> &CipherConfig {
        &self.cipher
    }

    /// Cleaner settings.
    #[must_use]
    pub fn cleaner(&self) -> &CleanerConfig {
        &self.cleaner
    }

    /// Configured lock mode.
    #[must_use]
    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    /// Bounded wait for a pessimistic lock.
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Lifetime of a lease lock record.
    #[must_use]
    pub fn lock_lease(&self) -> Duration {
        self.lock_lease
    }

    /// Deadline for one registry operation.
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Transient-failure retry budget.
    #[must_use]
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Compare-and-set restart budget.
    #[must_use]
    pub fn cas_retry(&self) -> &CasRetryConfig {
        &self.cas_retry
    }

    /// Whether session deletes cascade.
    #[must_use]
    pub fn remove_descendants(&self) -> bool {
        self.remove_descendants
    }

    /// Identifier settings.
    #[must_use]
    pub fn id(&self) -> &IdConfig {
        &self.id
    }

    /// This node's name.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Retention of consumed single-use ids.
    #[must_use]
    pub fn consumed_retention(&self) -> Duration {
        self.consumed_retention
    }

    /// Capacity of the consumed-id memory.
    #[must_use]
    pub fn consumed_capacity(&self) -> u64 {
        self.consumed_capacity
    }
}
