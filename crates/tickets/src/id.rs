//! Ticket identifier generation.
//!
//! Identifiers have the shape `PREFIX-COUNTER-RANDOM[-SUFFIX]`:
//!
//! - `COUNTER` is a per-generator decimal sequence, distinct for every call;
//! - `RANDOM` is `random_bytes` from the thread-local CSPRNG, encoded as
//!   unpadded URL-safe base64;
//! - `SUFFIX` is an optional node tag.
//!
//! The random segment alone carries at least 128 bits of entropy, so ids
//! stay unguessable and collision-free across nodes even though counters
//! are per node. The prefix never contains `-`, which lets the catalog
//! recover the ticket kind from the text before the first dash.

use std::sync::atomic::{AtomicU64, Ordering};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Minimum random bytes per id (128 bits).
pub const MIN_RANDOM_BYTES: usize = 16;

/// Default random bytes per id, encoding to 32 characters.
pub const DEFAULT_RANDOM_BYTES: usize = 24;

/// Longest accepted node suffix.
const MAX_SUFFIX_LEN: usize = 64;

/// Digits in `u64::MAX`.
const MAX_COUNTER_DIGITS: usize = 20;

/// Identifier generation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdConfig {
    /// Optional node tag appended to every id.
    #[serde(default)]
    pub(crate) suffix: Option<String>,

    /// Random bytes per id.
    #[serde(default = "default_random_bytes")]
    pub(crate) random_bytes: usize,
}

fn default_random_bytes() -> usize {
    DEFAULT_RANDOM_BYTES
}

impl Default for IdConfig {
    fn default() -> Self {
        Self { suffix: None, random_bytes: DEFAULT_RANDOM_BYTES }
    }
}

#[bon::bon]
impl IdConfig {
    /// Creates a validated id configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `random_bytes` is below
    /// [`MIN_RANDOM_BYTES`] or the suffix is not URL-safe.
    #[builder]
    pub fn new(
        #[builder(into)] suffix: Option<String>,
        #[builder(default = DEFAULT_RANDOM_BYTES)] random_bytes: usize,
    ) -> Result<Self, ConfigError> {
        let config = Self { suffix, random_bytes };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants enforced by the builder.
    ///
    /// # Errors
    ///
    /// See [`IdConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.random_bytes < MIN_RANDOM_BYTES {
            return Err(tessera_storage::ConfigError::BelowMinimum {
                field: "id.random_bytes",
                min: MIN_RANDOM_BYTES.to_string(),
                value: self.random_bytes.to_string(),
            }
            .into());
        }
        if let Some(suffix) = &self.suffix {
            let url_safe = suffix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
            if suffix.is_empty() || suffix.len() > MAX_SUFFIX_LEN || !url_safe {
                return Err(tessera_storage::ConfigError::Invalid {
                    field: "id.suffix",
                    reason: format!("{suffix:?} must be 1-{MAX_SUFFIX_LEN} URL-safe characters"),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Returns the node suffix.
    #[must_use]
    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    /// Returns the number of random bytes per id.
    #[must_use]
    pub fn random_bytes(&self) -> usize {
        self.random_bytes
    }
}

/// Generates unique, URL-safe ticket identifiers.
#[derive(Debug)]
pub struct TicketIdGenerator {
    counter: AtomicU64,
    random_bytes: usize,
    suffix: Option<String>,
}

impl TicketIdGenerator {
    /// Creates a generator from a validated configuration.
    #[must_use]
    pub fn new(config: &IdConfig) -> Self {
        Self {
            counter: AtomicU64::new(1),
            random_bytes: config.random_bytes.max(MIN_RANDOM_BYTES),
            suffix: config.suffix.clone(),
        }
    }

    /// Returns a fresh identifier starting with `prefix-`.
    ///
    /// ```
    /// use tessera_tickets::{IdConfig, TicketIdGenerator};
    ///
    /// let generator = TicketIdGenerator::new(&IdConfig::default());
    /// let id = generator.generate("ST");
    /// assert!(id.starts_with("ST-1-"));
    /// assert!(id.len() <= generator.max_len("ST"));
    /// ```
    #[must_use]
    pub fn generate(&self, prefix: &str) -> String {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed);

        let mut random = vec![0u8; self.random_bytes];
        rand::rng().fill_bytes(&mut random);
        let random = URL_SAFE_NO_PAD.encode(&random);

        match &self.suffix {
            Some(suffix) => format!("{prefix}-{sequence}-{random}-{suffix}"),
            None => format!("{prefix}-{sequence}-{random}"),
        }
    }

    /// Upper bound on the length of ids generated for `prefix`.
    #[must_use]
    pub fn max_len(&self, prefix: &str) -> usize {
        let random = self.random_bytes.div_ceil(3) * 4;
        let suffix = self.suffix.as_ref().map_or(0, |s| s.len() + 1);
        prefix.len() + 1 + MAX_COUNTER_DIGITS + 1 + random + suffix
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn ids_carry_prefix_sequence_and_suffix() {
        let config = IdConfig::builder().suffix("node-a").build().unwrap();
        let generator = TicketIdGenerator::new(&config);

        let first = generator.generate("TGT");
        let second = generator.generate("TGT");
        assert!(first.starts_with("TGT-1-"), "{first}");
        assert!(second.starts_with("TGT-2-"), "{second}");
        assert!(first.ends_with("-node-a"), "{first}");
    }

    #[test]
    fn random_segment_has_at_least_128_bits() {
        let err = IdConfig::builder().random_bytes(15).build().unwrap_err();
        assert!(matches!(err, ConfigError::Storage(_)));

        let generator = TicketIdGenerator::new(&IdConfig::default());
        let id = generator.generate("ST");
        let random = id.splitn(3, '-').nth(2).unwrap();
        assert_eq!(URL_SAFE_NO_PAD.decode(random).unwrap().len(), DEFAULT_RANDOM_BYTES);
    }

    #[test]
    fn suffix_must_be_url_safe() {
        for bad in ["", "node a", "node/a", "näde"] {
            assert!(IdConfig::builder().suffix(bad).build().is_err(), "{bad:?}");
        }
    }

    #[test]
    fn many_ids_are_unique() {
        let generator = TicketIdGenerator::new(&IdConfig::default());
        let ids: HashSet<String> = (0..10_000).map(|_| generator.generate("ST")).collect();
        assert_eq!(ids.len(), 10_000);
    }

    proptest! {
        #[test]
        fn ids_are_url_safe_and_bounded(
            prefix in "[A-Z]{1,4}",
            random_bytes in MIN_RANDOM_BYTES..64usize,
            suffix in proptest::option::of("[a-z0-9.]{1,12}"),
        ) {
            let config = IdConfig { suffix, random_bytes };
            let generator = TicketIdGenerator::new(&config);
            let id = generator.generate(&prefix);

            prop_assert!(id.len() <= generator.max_len(&prefix));
            let expected_start = format!("{prefix}-");
            prop_assert!(id.starts_with(&expected_start));
            prop_assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')));
        }
    }
}
