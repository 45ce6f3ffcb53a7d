//! Expiration policies.
//!
//! A policy is a pure function of a ticket's own timestamps and the current
//! time: [`ExpirationPolicy::is_expired`] reads nothing else. Every variant
//! is monotonic in `now`, so a ticket that is expired at `t` stays expired
//! at every later instant for the same [`TicketState`].
//!
//! | Variant | Expired when |
//! |---------|--------------|
//! | `Never` | never (storage still caps at [`MAX_TIME_TO_LIVE`]) |
//! | `Always` | always |
//! | `HardTimeout` | `now >= created + time_to_live` |
//! | `IdleTimeout` | `now >= last_used + time_to_idle` |
//! | `HardOrIdle` | either of the above |
//! | `MultiUse` | `uses >= max_uses` or `now >= created + time_to_live` |
//! | `Throttled` | as the wrapped policy |

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    clock::add_saturating,
    error::ConfigError,
    ticket::TicketState,
};

/// Upper bound on any stored expiration: ten years after creation.
pub const MAX_TIME_TO_LIVE: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// How a ticket ages out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExpirationPolicy {
    /// Never expires.
    Never,

    /// Always expired; useful to disable a kind.
    Always,

    /// Expires a fixed time after creation.
    HardTimeout {
        /// Lifetime measured from creation.
        #[serde(with = "humantime_serde")]
        time_to_live: Duration,
    },

    /// Expires after a period without use; each use slides the window.
    IdleTimeout {
        /// Allowed gap since the last use.
        #[serde(with = "humantime_serde")]
        time_to_idle: Duration,
    },

    /// Expires on whichever of the hard or idle limits fires first.
    HardOrIdle {
        /// Lifetime measured from creation.
        #[serde(with = "humantime_serde")]
        time_to_live: Duration,
        /// Allowed gap since the last use.
        #[serde(with = "humantime_serde")]
        time_to_idle: Duration,
    },

    /// Expires after `max_uses` validations or a fixed time after creation.
    MultiUse {
        /// Validations allowed before the ticket is spent.
        max_uses: u32,
        /// Lifetime measured from creation.
        #[serde(with = "humantime_serde")]
        time_to_live: Duration,
    },

    /// Delegates expiry to `inner` and additionally refuses uses that come
    /// sooner than `min_interval` after the previous one.
    Throttled {
        /// Policy deciding expiry.
        inner: Box<ExpirationPolicy>,
        /// Minimum spacing between uses.
        #[serde(with = "humantime_serde")]
        min_interval: Duration,
    },
}

impl ExpirationPolicy {
    /// Returns `true` if a ticket in `state` is expired at `now`.
    #[must_use]
    pub fn is_expired(&self, state: &TicketState, now: DateTime<Utc>) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::HardTimeout { time_to_live } => {
                now >= add_saturating(state.created_at(), *time_to_live)
            },
            Self::IdleTimeout { time_to_idle } => {
                now >= add_saturating(state.last_time_used(), *time_to_idle)
            },
            Self::HardOrIdle { time_to_live, time_to_idle } => {
                now >= add_saturating(state.created_at(), *time_to_live)
                    || now >= add_saturating(state.last_time_used(), *time_to_idle)
            },
            Self::MultiUse { max_uses, time_to_live } => {
                state.count_of_uses() >= *max_uses
                    || now >= add_saturating(state.created_at(), *time_to_live)
            },
            Self::Throttled { inner, .. } => inner.is_expired(state, now),
        }
    }

    /// Returns `false` if a use at `now` comes too soon after the previous one.
    ///
    /// Only [`Throttled`](Self::Throttled) ever refuses; the first use is
    /// always allowed.
    #[must_use]
    pub fn allows_use(&self, state: &TicketState, now: DateTime<Utc>) -> bool {
        match self {
            Self::Throttled { min_interval, .. } => {
                state.count_of_uses() == 0
                    || now >= add_saturating(state.last_time_used(), *min_interval)
            },
            _ => true,
        }
    }

    /// The instant after which the ticket is expired unless it is used again.
    ///
    /// This is what storage TTLs are derived from. It is capped at
    /// [`MAX_TIME_TO_LIVE`] after creation, and is the creation time for a
    /// ticket whose uses are exhausted.
    #[must_use]
    pub fn expires_at(&self, state: &TicketState) -> DateTime<Utc> {
        let created = state.created_at();
        let cap = add_saturating(created, MAX_TIME_TO_LIVE);
        let deadline = match self {
            Self::Never => cap,
            Self::Always => created,
            Self::HardTimeout { time_to_live } => add_saturating(created, *time_to_live),
            Self::IdleTimeout { time_to_idle } => {
                add_saturating(state.last_time_used(), *time_to_idle)
            },
            Self::HardOrIdle { time_to_live, time_to_idle } => add_saturating(created, *time_to_live)
                .min(add_saturating(state.last_time_used(), *time_to_idle)),
            Self::MultiUse { max_uses, time_to_live } => {
                if state.count_of_uses() >= *max_uses {
                    created
                } else {
                    add_saturating(created, *time_to_live)
                }
            },
            Self::Throttled { inner, .. } => inner.expires_at(state),
        };
        deadline.min(cap)
    }

    /// Configured hard lifetime, if any.
    #[must_use]
    pub fn time_to_live(&self) -> Option<Duration> {
        match self {
            Self::HardTimeout { time_to_live }
            | Self::HardOrIdle { time_to_live, .. }
            | Self::MultiUse { time_to_live, .. } => Some(*time_to_live),
            Self::Throttled { inner, .. } => inner.time_to_live(),
            Self::Never | Self::Always | Self::IdleTimeout { .. } => None,
        }
    }

    /// Configured idle window, if any.
    #[must_use]
    pub fn time_to_idle(&self) -> Option<Duration> {
        match self {
            Self::IdleTimeout { time_to_idle } | Self::HardOrIdle { time_to_idle, .. } => {
                Some(*time_to_idle)
            },
            Self::Throttled { inner, .. } => inner.time_to_idle(),
            _ => None,
        }
    }

    /// Returns `true` if the policy can be spent by validations.
    #[must_use]
    pub fn is_use_limited(&self) -> bool {
        match self {
            Self::MultiUse { .. } => true,
            Self::Throttled { inner, .. } => inner.is_use_limited(),
            _ => false,
        }
    }

    /// Rejects policies that would expire every ticket immediately by
    /// accident (zero durations, zero uses).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPolicy`] naming `kind`.
    pub fn validate(&self, kind: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPolicy {
            kind: kind.to_owned(),
            reason: reason.to_owned(),
        };
        match self {
            Self::Never | Self::Always => Ok(()),
            Self::HardTimeout { time_to_live } if time_to_live.is_zero() => {
                Err(invalid("time_to_live must be positive"))
            },
            Self::IdleTimeout { time_to_idle } if time_to_idle.is_zero() => {
                Err(invalid("time_to_idle must be positive"))
            },
            Self::HardOrIdle { time_to_live, time_to_idle }
                if time_to_live.is_zero() || time_to_idle.is_zero() =>
            {
                Err(invalid("time_to_live and time_to_idle must be positive"))
            },
            Self::MultiUse { max_uses: 0, .. } => Err(invalid("max_uses must be at least 1")),
            Self::MultiUse { time_to_live, .. } if time_to_live.is_zero() => {
                Err(invalid("time_to_live must be positive"))
            },
            Self::Throttled { inner, .. } if matches!(**inner, Self::Throttled { .. }) => {
                Err(invalid("throttled policies do not nest"))
            },
            Self::Throttled { inner, .. } => inner.validate(kind),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::TimeDelta;
    use proptest::prelude::*;

    use super::*;

    fn at(base: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        base + TimeDelta::seconds(secs)
    }

    #[test]
    fn hard_timeout_boundary() {
        let t0 = Utc::now();
        let state = TicketState::new(t0);
        let policy = ExpirationPolicy::HardTimeout { time_to_live: Duration::from_secs(10) };

        assert!(!policy.is_expired(&state, at(t0, 9)));
        assert!(!policy.is_expired(&state, t0 + TimeDelta::milliseconds(9_999)));
        assert!(policy.is_expired(&state, at(t0, 10)));
        assert!(policy.is_expired(&state, at(t0, 11)));
    }

    #[test]
    fn idle_timeout_slides_with_use() {
        let t0 = Utc::now();
        let policy = ExpirationPolicy::IdleTimeout { time_to_idle: Duration::from_secs(5) };

        let unused = TicketState::new(t0);
        assert!(!policy.is_expired(&unused, at(t0, 4)));
        assert!(policy.is_expired(&unused, at(t0, 6)));

        let reused = unused.update(at(t0, 3));
        assert!(!policy.is_expired(&reused, at(t0, 6)));
        assert!(policy.is_expired(&reused, at(t0, 8)));
    }

    #[test]
    fn hard_or_idle_fires_on_either_limit() {
        let t0 = Utc::now();
        let policy = ExpirationPolicy::HardOrIdle {
            time_to_live: Duration::from_secs(60),
            time_to_idle: Duration::from_secs(10),
        };
        let mut state = TicketState::new(t0);
        assert!(policy.is_expired(&state, at(t0, 10)));

        for secs in (5..60).step_by(5) {
            assert!(!policy.is_expired(&state, at(t0, secs)), "at +{secs}s");
            state = state.update(at(t0, secs));
        }
        assert!(policy.is_expired(&state, at(t0, 60)));
    }

    #[test]
    fn multi_use_is_spent_by_validations() {
        let t0 = Utc::now();
        let policy =
            ExpirationPolicy::MultiUse { max_uses: 2, time_to_live: Duration::from_secs(30) };
        let state = TicketState::new(t0);
        assert!(!policy.is_expired(&state, t0));

        let once = state.update(at(t0, 1));
        assert!(!policy.is_expired(&once, at(t0, 1)));
        let twice = once.update(at(t0, 2));
        assert!(policy.is_expired(&twice, at(t0, 2)));
        assert_eq!(policy.expires_at(&twice), t0);
    }

    #[test]
    fn throttled_refuses_rapid_reuse_without_expiring() {
        let t0 = Utc::now();
        let policy = ExpirationPolicy::Throttled {
            inner: Box::new(ExpirationPolicy::Never),
            min_interval: Duration::from_secs(2),
        };
        let state = TicketState::new(t0);
        assert!(policy.allows_use(&state, t0));

        let used = state.update(t0);
        assert!(!policy.allows_use(&used, at(t0, 1)));
        assert!(!policy.is_expired(&used, at(t0, 1)));
        assert!(policy.allows_use(&used, at(t0, 2)));
    }

    #[test]
    fn expiry_is_capped_at_ten_years() {
        let t0 = Utc::now();
        let state = TicketState::new(t0);
        let cap = add_saturating(t0, MAX_TIME_TO_LIVE);

        assert_eq!(ExpirationPolicy::Never.expires_at(&state), cap);
        let long =
            ExpirationPolicy::HardTimeout { time_to_live: Duration::from_secs(u64::from(u32::MAX) * 100) };
        assert_eq!(long.expires_at(&state), cap);
    }

    #[test]
    fn reports_configured_values() {
        let policy = ExpirationPolicy::Throttled {
            inner: Box::new(ExpirationPolicy::HardOrIdle {
                time_to_live: Duration::from_secs(8 * 3600),
                time_to_idle: Duration::from_secs(7200),
            }),
            min_interval: Duration::from_secs(1),
        };
        assert_eq!(policy.time_to_live(), Some(Duration::from_secs(8 * 3600)));
        assert_eq!(policy.time_to_idle(), Some(Duration::from_secs(7200)));
        assert_eq!(ExpirationPolicy::Never.time_to_live(), None);
    }

    #[test]
    fn degenerate_policies_are_rejected() {
        let zero = ExpirationPolicy::HardTimeout { time_to_live: Duration::ZERO };
        assert!(matches!(zero.validate("service"), Err(ConfigError::InvalidPolicy { .. })));

        let no_uses = ExpirationPolicy::MultiUse { max_uses: 0, time_to_live: Duration::from_secs(1) };
        assert!(no_uses.validate("service").is_err());

        let nested = ExpirationPolicy::Throttled {
            inner: Box::new(ExpirationPolicy::Throttled {
                inner: Box::new(ExpirationPolicy::Never),
                min_interval: Duration::from_secs(1),
            }),
            min_interval: Duration::from_secs(1),
        };
        assert!(nested.validate("service").is_err());
    }

    #[test]
    fn deserializes_human_readable_durations() {
        let policy: ExpirationPolicy =
            serde_json::from_str(r#"{ "type": "hard_or_idle", "time_to_live": "8h", "time_to_idle": "2h" }"#)
                .unwrap();
        assert_eq!(
            policy,
            ExpirationPolicy::HardOrIdle {
                time_to_live: Duration::from_secs(8 * 3600),
                time_to_idle: Duration::from_secs(2 * 3600),
            }
        );
    }

    fn any_policy() -> impl Strategy<Value = ExpirationPolicy> {
        let secs = 1u64..100_000;
        let base = prop_oneof![
            Just(ExpirationPolicy::Never),
            Just(ExpirationPolicy::Always),
            secs.clone().prop_map(|s| ExpirationPolicy::HardTimeout {
                time_to_live: Duration::from_secs(s)
            }),
            secs.clone().prop_map(|s| ExpirationPolicy::IdleTimeout {
                time_to_idle: Duration::from_secs(s)
            }),
            (secs.clone(), secs.clone()).prop_map(|(l, i)| ExpirationPolicy::HardOrIdle {
                time_to_live: Duration::from_secs(l),
                time_to_idle: Duration::from_secs(i),
            }),
            (1u32..5, secs.clone()).prop_map(|(n, l)| ExpirationPolicy::MultiUse {
                max_uses: n,
                time_to_live: Duration::from_secs(l),
            }),
        ];
        (base, proptest::option::of(secs)).prop_map(|(policy, throttle)| match throttle {
            Some(s) => ExpirationPolicy::Throttled {
                inner: Box::new(policy),
                min_interval: Duration::from_secs(s),
            },
            None => policy,
        })
    }

    proptest! {
        #[test]
        fn expiry_is_monotonic_in_time(
            policy in any_policy(),
            uses in proptest::collection::vec(0i64..50_000, 0..4),
            t in 0i64..200_000,
            later in 0i64..200_000,
        ) {
            let t0 = Utc::now();
            let mut state = TicketState::new(t0);
            let mut sorted = uses;
            sorted.sort_unstable();
            for offset in sorted {
                state = state.update(at(t0, offset));
            }

            if policy.is_expired(&state, at(t0, t)) {
                prop_assert!(policy.is_expired(&state, at(t0, t + later)));
            }
        }

        #[test]
        fn not_expired_before_expires_at(policy in any_policy(), offset in 0i64..200_000) {
            let t0 = Utc::now();
            let state = TicketState::new(t0);
            let now = at(t0, offset);
            if now < policy.expires_at(&state) {
                prop_assert!(!policy.is_expired(&state, now));
            }
        }
    }
}
