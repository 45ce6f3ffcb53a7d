//! Ticket kinds and their definitions.
//!
//! The catalog is built once at startup from per-kind overrides layered on
//! built-in defaults, validated eagerly, and shared read-only afterwards.
//! Every [`TicketKind`] always has a definition, so lookups by kind cannot
//! fail; lookups by id resolve the prefix before the first `-`.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, expiration::ExpirationPolicy};

const HOUR: u64 = 60 * 60;

/// Every kind of ticket the subsystem issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TicketKind {
    /// Ticket-granting ticket: the SSO session.
    #[serde(rename = "ticket_granting")]
    TicketGranting,
    /// Proxy-granting ticket: a session delegated to a proxying service.
    #[serde(rename = "proxy_granting")]
    ProxyGranting,
    /// Service ticket, presented once to an application.
    #[serde(rename = "service")]
    Service,
    /// Proxy ticket, issued from a proxy-granting ticket.
    #[serde(rename = "proxy")]
    Proxy,
    /// OAuth authorization code.
    #[serde(rename = "oauth_code")]
    OAuthCode,
    /// OAuth access token.
    #[serde(rename = "access_token")]
    AccessToken,
    /// OAuth refresh token.
    #[serde(rename = "refresh_token")]
    RefreshToken,
}

impl TicketKind {
    /// All kinds, session-granting kinds last.
    pub const ALL: [TicketKind; 7] = [
        Self::Service,
        Self::Proxy,
        Self::OAuthCode,
        Self::AccessToken,
        Self::RefreshToken,
        Self::ProxyGranting,
        Self::TicketGranting,
    ];

    /// Configuration name of the kind.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::TicketGranting => "ticket_granting",
            Self::ProxyGranting => "proxy_granting",
            Self::Service => "service",
            Self::Proxy => "proxy",
            Self::OAuthCode => "oauth_code",
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
        }
    }

    /// Returns `true` for kinds that own a descendant set.
    #[must_use]
    pub fn is_session(self) -> bool {
        matches!(self, Self::TicketGranting | Self::ProxyGranting)
    }

    /// Returns `true` for kinds spent by their first successful validation.
    ///
    /// This holds whatever time policy is configured; only a use-limited
    /// policy ([`ExpirationPolicy::is_use_limited`]) may grant more uses.
    #[must_use]
    pub fn is_single_use(self) -> bool {
        matches!(self, Self::Service | Self::Proxy | Self::OAuthCode)
    }

    fn default_prefix(self) -> &'static str {
        match self {
            Self::TicketGranting => "TGT",
            Self::ProxyGranting => "PGT",
            Self::Service => "ST",
            Self::Proxy => "PT",
            Self::OAuthCode => "OC",
            Self::AccessToken => "AT",
            Self::RefreshToken => "RT",
        }
    }

    fn default_storage_name(self) -> &'static str {
        match self {
            Self::TicketGranting => "ticket-granting-tickets",
            Self::ProxyGranting => "proxy-granting-tickets",
            Self::Service => "service-tickets",
            Self::Proxy => "proxy-tickets",
            Self::OAuthCode => "oauth-codes",
            Self::AccessToken => "oauth-access-tokens",
            Self::RefreshToken => "oauth-refresh-tokens",
        }
    }

    fn default_policy(self) -> ExpirationPolicy {
        let session = ExpirationPolicy::HardOrIdle {
            time_to_live: Duration::from_secs(8 * HOUR),
            time_to_idle: Duration::from_secs(2 * HOUR),
        };
        match self {
            Self::TicketGranting | Self::ProxyGranting | Self::AccessToken => session,
            Self::Service | Self::Proxy => {
                ExpirationPolicy::MultiUse { max_uses: 1, time_to_live: Duration::from_secs(10) }
            },
            Self::OAuthCode => {
                ExpirationPolicy::MultiUse { max_uses: 1, time_to_live: Duration::from_secs(30) }
            },
            Self::RefreshToken => {
                ExpirationPolicy::HardTimeout { time_to_live: Duration::from_secs(30 * 24 * HOUR) }
            },
        }
    }
}

impl fmt::Display for TicketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TicketKind {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| ConfigError::UnknownTicketKind { name: name.to_owned() })
    }
}

/// Per-kind configuration override. Unset fields keep the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TicketOverride {
    /// Id prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Storage namespace.
    #[serde(default)]
    pub storage_name: Option<String>,
    /// Expiration policy.
    #[serde(default)]
    pub policy: Option<ExpirationPolicy>,
    /// Whether payloads of this kind go through the cipher.
    #[serde(default)]
    pub encrypted: Option<bool>,
}

/// Immutable metadata for one ticket kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketDefinition {
    pub(crate) kind: TicketKind,
    pub(crate) prefix: String,
    pub(crate) storage_name: String,
    pub(crate) policy: ExpirationPolicy,
    pub(crate) encrypted: bool,
}

impl TicketDefinition {
    fn default_for(kind: TicketKind) -> Self {
        Self {
            kind,
            prefix: kind.default_prefix().to_owned(),
            storage_name: kind.default_storage_name().to_owned(),
            policy: kind.default_policy(),
            encrypted: true,
        }
    }

    /// The kind described.
    #[must_use]
    pub fn kind(&self) -> TicketKind {
        self.kind
    }

    /// Id prefix, without the trailing `-`.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Storage namespace; keys are `{storage_name}/{id or digest}`.
    #[must_use]
    pub fn storage_name(&self) -> &str {
        &self.storage_name
    }

    /// Policy attached to newly issued tickets.
    #[must_use]
    pub fn policy(&self) -> &ExpirationPolicy {
        &self.policy
    }

    /// Whether payloads go through the cipher when one is enabled.
    #[must_use]
    pub fn encrypted(&self) -> bool {
        self.encrypted
    }
}

/// Validated table of ticket definitions.
#[derive(Debug, Clone)]
pub struct TicketCatalog {
    definitions: BTreeMap<TicketKind, TicketDefinition>,
    by_prefix: HashMap<String, TicketKind>,
}

impl TicketCatalog {
    /// Builds the catalog from per-kind overrides keyed by kind name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an unknown kind name, a malformed or
    /// duplicate prefix or storage name, or an invalid policy.
    pub fn from_overrides(overrides: &BTreeMap<String, TicketOverride>) -> Result<Self, ConfigError> {
        let mut definitions: BTreeMap<TicketKind, TicketDefinition> = TicketKind::ALL
            .into_iter()
            .map(|kind| (kind, TicketDefinition::default_for(kind)))
            .collect();

        for (name, patch) in overrides {
            let kind: TicketKind = name.parse()?;
            let Some(definition) = definitions.get_mut(&kind) else {
                continue;
            };
            if let Some(prefix) = &patch.prefix {
                definition.prefix.clone_from(prefix);
            }
            if let Some(storage_name) = &patch.storage_name {
                definition.storage_name.clone_from(storage_name);
            }
            if let Some(policy) = &patch.policy {
                definition.policy = policy.clone();
            }
            if let Some(encrypted) = patch.encrypted {
                definition.encrypted = encrypted;
            }
        }

        let mut by_prefix = HashMap::new();
        let mut storage_names = HashSet::new();
        for definition in definitions.values() {
            validate_prefix(&definition.prefix)?;
            validate_storage_name(&definition.storage_name)?;
            definition.policy.validate(definition.kind.name())?;

            if by_prefix.insert(definition.prefix.clone(), definition.kind).is_some() {
                return Err(ConfigError::InvalidPrefix {
                    prefix: definition.prefix.clone(),
                    reason: "used by more than one kind".into(),
                });
            }
            if !storage_names.insert(definition.storage_name.as_str()) {
                return Err(ConfigError::InvalidStorageName {
                    name: definition.storage_name.clone(),
                    reason: "used by more than one kind".into(),
                });
            }
        }

        Ok(Self { definitions, by_prefix })
    }

    /// Definition of `kind`.
    #[must_use]
    pub fn definition(&self, kind: TicketKind) -> &TicketDefinition {
        // Populated for every kind by construction.
        &self.definitions[&kind]
    }

    /// Resolves the definition owning `id` from its prefix.
    #[must_use]
    pub fn find_by_id(&self, id: &str) -> Option<&TicketDefinition> {
        let (prefix, _) = id.split_once('-')?;
        let kind = self.by_prefix.get(prefix)?;
        self.definitions.get(kind)
    }

    /// All definitions in kind order.
    pub fn definitions(&self) -> impl Iterator<Item = &TicketDefinition> {
        self.definitions.values()
    }
}

impl Default for TicketCatalog {
    fn default() -> Self {
        let definitions: BTreeMap<TicketKind, TicketDefinition> = TicketKind::ALL
            .into_iter()
            .map(|kind| (kind, TicketDefinition::default_for(kind)))
            .collect();
        let by_prefix =
            definitions.values().map(|d| (d.prefix.clone(), d.kind)).collect::<HashMap<_, _>>();
        Self { definitions, by_prefix }
    }
}

fn validate_prefix(prefix: &str) -> Result<(), ConfigError> {
    let well_formed = !prefix.is_empty()
        && prefix.len() <= 8
        && prefix.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    if well_formed {
        Ok(())
    } else {
        Err(ConfigError::InvalidPrefix {
            prefix: prefix.to_owned(),
            reason: "must be 1-8 uppercase letters or digits".into(),
        })
    }
}

fn validate_storage_name(name: &str) -> Result<(), ConfigError> {
    let well_formed = !name.is_empty()
        && !name.starts_with("__")
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if well_formed {
        Ok(())
    } else {
        Err(ConfigError::InvalidStorageName {
            name: name.to_owned(),
            reason: "must be lowercase letters, digits, '-' or '_' and not start with '__'".into(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn overrides(json: &str) -> BTreeMap<String, TicketOverride> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn defaults_cover_every_kind() {
        let catalog = TicketCatalog::from_overrides(&BTreeMap::new()).unwrap();
        for kind in TicketKind::ALL {
            assert_eq!(catalog.definition(kind).kind(), kind);
        }
        assert_eq!(catalog.definition(TicketKind::Service).prefix(), "ST");
        assert_eq!(
            catalog.definition(TicketKind::OAuthCode).policy(),
            &ExpirationPolicy::MultiUse { max_uses: 1, time_to_live: Duration::from_secs(30) }
        );
        assert_eq!(catalog.definitions().count(), 7);
    }

    #[test]
    fn default_catalog_matches_empty_overrides() {
        let built = TicketCatalog::from_overrides(&BTreeMap::new()).unwrap();
        let default = TicketCatalog::default();
        for kind in TicketKind::ALL {
            assert_eq!(built.definition(kind), default.definition(kind));
        }
    }

    #[test]
    fn overrides_replace_single_fields() {
        let catalog = TicketCatalog::from_overrides(&overrides(
            r#"{ "service": { "policy": { "type": "hard_timeout", "time_to_live": "5s" }, "encrypted": false } }"#,
        ))
        .unwrap();
        let service = catalog.definition(TicketKind::Service);
        assert_eq!(service.prefix(), "ST");
        assert_eq!(service.policy().time_to_live(), Some(Duration::from_secs(5)));
        assert!(!service.encrypted());
    }

    #[test]
    fn single_use_kinds() {
        let single: Vec<_> = TicketKind::ALL.into_iter().filter(|k| k.is_single_use()).collect();
        assert_eq!(single, [TicketKind::Service, TicketKind::Proxy, TicketKind::OAuthCode]);
        assert!(TicketKind::ALL.into_iter().all(|k| !(k.is_single_use() && k.is_session())));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = TicketCatalog::from_overrides(&overrides(r#"{ "golden_ticket": {} }"#)).unwrap_err();
        assert_eq!(err, ConfigError::UnknownTicketKind { name: "golden_ticket".into() });
    }

    #[test]
    fn duplicate_prefix_is_rejected() {
        let err =
            TicketCatalog::from_overrides(&overrides(r#"{ "proxy": { "prefix": "ST" } }"#)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPrefix { .. }));
    }

    #[test]
    fn prefixes_cannot_contain_dashes() {
        let err = TicketCatalog::from_overrides(&overrides(r#"{ "service": { "prefix": "S-T" } }"#))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPrefix { .. }));
    }

    #[test]
    fn lock_namespace_is_reserved() {
        let err = TicketCatalog::from_overrides(&overrides(
            r#"{ "service": { "storage_name": "__locks" } }"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStorageName { .. }));
    }

    #[test]
    fn ids_resolve_by_prefix() {
        let catalog = TicketCatalog::default();
        assert_eq!(catalog.find_by_id("PGT-4-xyz").unwrap().kind(), TicketKind::ProxyGranting);
        assert_eq!(catalog.find_by_id("ST-1-abc-node-a").unwrap().kind(), TicketKind::Service);
        assert!(catalog.find_by_id("XX-1-abc").is_none());
        assert!(catalog.find_by_id("ST").is_none());
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in TicketKind::ALL {
            assert_eq!(kind.name().parse::<TicketKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.name()));
        }
    }
}
