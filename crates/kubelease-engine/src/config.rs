//! Administrative configuration
//!
//! [`ConfigRecord`] is the flat field set an administrator writes and that is
//! persisted verbatim. [`Configuration`] is the validated, typed view the
//! orchestrator works from. A record only becomes a configuration through
//! [`ConfigRecord::validate`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use kubelease_common::{Error, Result};

use crate::ttl::MAX_REPRESENTABLE_TTL_SECS;

/// Default maximum lease TTL (30 minutes)
pub const DEFAULT_MAX_TTL_SECS: u64 = 1800;
/// Default lease TTL when the caller does not ask for one
pub const DEFAULT_TTL_SECS: u64 = 600;
/// Default bound on waiting for a new identity's token
pub const DEFAULT_CREDENTIAL_WAIT_SECS: u64 = 10;
/// Default interval between token lookups while waiting
pub const DEFAULT_CREDENTIAL_POLL_MILLIS: u64 = 500;
/// Longest accepted wait for an identity's token, seconds
pub const MAX_CREDENTIAL_WAIT_SECS: u64 = 300;
/// Longest accepted interval between token lookups, milliseconds
pub const MAX_CREDENTIAL_POLL_MILLIS: u64 = 60_000;

/// Tiers every deployment understands
pub const BUILTIN_TIERS: [&str; 3] = ["admin", "editor", "viewer"];

const REDACTED: &str = "<redacted>";

/// Kind of role a binding references
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingKind {
    /// Cluster-wide role, granted only inside the lease namespace
    #[default]
    ClusterRole,
    /// Role defined in the lease namespace
    Role,
}

impl BindingKind {
    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingKind::ClusterRole => "ClusterRole",
            BindingKind::Role => "Role",
        }
    }
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tiers a deployment accepts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TierPolicy {
    /// Any configured tier; at least one binding required
    #[default]
    Open,
    /// Exactly admin, editor and viewer, all required
    Builtin,
}

impl FromStr for TierPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(TierPolicy::Open),
            "builtin" => Ok(TierPolicy::Builtin),
            other => Err(format!(
                "unknown tier policy '{}', expected 'open' or 'builtin'",
                other
            )),
        }
    }
}

impl fmt::Display for TierPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TierPolicy::Open => "open",
            TierPolicy::Builtin => "builtin",
        })
    }
}

fn default_max_ttl() -> u64 {
    DEFAULT_MAX_TTL_SECS
}

fn default_ttl() -> u64 {
    DEFAULT_TTL_SECS
}

fn default_credential_wait() -> u64 {
    DEFAULT_CREDENTIAL_WAIT_SECS
}

fn default_credential_poll() -> u64 {
    DEFAULT_CREDENTIAL_POLL_MILLIS
}

/// Flat configuration record, as written by an administrator
///
/// Fields are only ever added; older records deserialize with defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRecord {
    /// Upper bound on any lease, seconds
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u64,
    /// Lease TTL used when the caller asks for none, seconds
    #[serde(default = "default_ttl")]
    pub default_ttl: u64,
    /// API server URL of the target cluster
    #[serde(default)]
    pub base_url: String,
    /// PEM CA bundle trusted for the target cluster
    #[serde(default)]
    pub ca_cert: String,
    /// Bearer token of the administrative identity
    #[serde(default)]
    pub jwt: String,
    /// Role bound for the `admin` tier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_role: Option<String>,
    /// Role bound for the `editor` tier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor_role: Option<String>,
    /// Role bound for the `viewer` tier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewer_role: Option<String>,
    /// Additional tiers and their roles
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_tiers: BTreeMap<String, String>,
    /// Kind of role the bindings reference
    #[serde(default)]
    pub role_kind: BindingKind,
    /// Bound on waiting for an identity's token, seconds
    #[serde(default = "default_credential_wait")]
    pub credential_wait_secs: u64,
    /// Interval between token lookups, milliseconds
    #[serde(default = "default_credential_poll")]
    pub credential_poll_millis: u64,
}

impl Default for ConfigRecord {
    fn default() -> Self {
        Self {
            max_ttl: DEFAULT_MAX_TTL_SECS,
            default_ttl: DEFAULT_TTL_SECS,
            base_url: String::new(),
            ca_cert: String::new(),
            jwt: String::new(),
            admin_role: None,
            editor_role: None,
            viewer_role: None,
            extra_tiers: BTreeMap::new(),
            role_kind: BindingKind::default(),
            credential_wait_secs: DEFAULT_CREDENTIAL_WAIT_SECS,
            credential_poll_millis: DEFAULT_CREDENTIAL_POLL_MILLIS,
        }
    }
}

impl ConfigRecord {
    /// Start a record for a cluster
    pub fn new(
        base_url: impl Into<String>,
        ca_cert: impl Into<String>,
        jwt: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            ca_cert: ca_cert.into(),
            jwt: jwt.into(),
            ..Default::default()
        }
    }

    /// Set the maximum and default TTLs, in seconds
    pub fn with_ttls(mut self, max_ttl: u64, default_ttl: u64) -> Self {
        self.max_ttl = max_ttl;
        self.default_ttl = default_ttl;
        self
    }

    /// Bind a tier to a role name
    pub fn with_tier(mut self, tier: impl Into<String>, role: impl Into<String>) -> Self {
        let tier = tier.into();
        let role = Some(role.into());
        match tier.as_str() {
            "admin" => self.admin_role = role,
            "editor" => self.editor_role = role,
            "viewer" => self.viewer_role = role,
            _ => {
                self.extra_tiers.insert(tier, role.unwrap_or_default());
            }
        }
        self
    }

    /// Set the role kind bindings reference
    pub fn with_role_kind(mut self, kind: BindingKind) -> Self {
        self.role_kind = kind;
        self
    }

    /// Set how long and how often to look for a new identity's token
    pub fn with_credential_wait(mut self, wait_secs: u64, poll_millis: u64) -> Self {
        self.credential_wait_secs = wait_secs;
        self.credential_poll_millis = poll_millis;
        self
    }

    /// Copy of the record with the admin credential hidden
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.jwt.is_empty() {
            copy.jwt = REDACTED.to_string();
        }
        copy
    }

    /// Validate the record against a tier policy
    pub fn validate(&self, policy: TierPolicy) -> Result<Configuration> {
        let cluster_host = validate_base_url(&self.base_url)?;

        require_non_empty("jwt", &self.jwt)?;
        require_non_empty("ca_cert", &self.ca_cert)?;

        for (field, value) in [
            ("max_ttl", self.max_ttl),
            ("default_ttl", self.default_ttl),
            ("credential_wait_secs", self.credential_wait_secs),
            ("credential_poll_millis", self.credential_poll_millis),
        ] {
            if value == 0 {
                return Err(Error::configuration_field(field, "must be greater than zero"));
            }
        }
        for (field, value) in [("max_ttl", self.max_ttl), ("default_ttl", self.default_ttl)] {
            if value > MAX_REPRESENTABLE_TTL_SECS as u64 {
                return Err(Error::configuration_field(
                    field,
                    format!("must not exceed {} seconds", MAX_REPRESENTABLE_TTL_SECS),
                ));
            }
        }

        for (field, value, max, unit) in [
            (
                "credential_wait_secs",
                self.credential_wait_secs,
                MAX_CREDENTIAL_WAIT_SECS,
                "seconds",
            ),
            (
                "credential_poll_millis",
                self.credential_poll_millis,
                MAX_CREDENTIAL_POLL_MILLIS,
                "milliseconds",
            ),
        ] {
            if value > max {
                return Err(Error::configuration_field(
                    field,
                    format!("must not exceed {} {}", max, unit),
                ));
            }
        }

        let tier_bindings = self.tier_bindings(policy)?;

        Ok(Configuration {
            max_ttl: Duration::from_secs(self.max_ttl),
            default_ttl: Duration::from_secs(self.default_ttl),
            cluster_host,
            ca_cert: self.ca_cert.clone(),
            admin_credential: self.jwt.clone(),
            tier_bindings,
            role_kind: self.role_kind,
            credential_wait: Duration::from_secs(self.credential_wait_secs),
            credential_poll_interval: Duration::from_millis(self.credential_poll_millis),
        })
    }

    fn tier_bindings(&self, policy: TierPolicy) -> Result<BTreeMap<String, String>> {
        let builtin = [
            ("admin", "admin_role", &self.admin_role),
            ("editor", "editor_role", &self.editor_role),
            ("viewer", "viewer_role", &self.viewer_role),
        ];

        let mut bindings = BTreeMap::new();
        for (tier, field, role) in builtin {
            match role.as_deref().map(str::trim) {
                Some(role) if !role.is_empty() => {
                    bindings.insert(tier.to_string(), role.to_string());
                }
                _ if policy == TierPolicy::Builtin => {
                    return Err(Error::configuration_field(
                        field,
                        "is required by the builtin tier policy",
                    ));
                }
                _ => {}
            }
        }

        if policy == TierPolicy::Builtin && !self.extra_tiers.is_empty() {
            return Err(Error::configuration_field(
                "extra_tiers",
                "is not accepted by the builtin tier policy",
            ));
        }

        for (tier, role) in &self.extra_tiers {
            let field = format!("extra_tiers.{}", tier);
            validate_tier_name(&field, tier)?;
            if BUILTIN_TIERS.contains(&tier.as_str()) {
                return Err(Error::configuration_field(
                    field,
                    format!("use {}_role to bind the builtin tier", tier),
                ));
            }
            require_non_empty(&field, role)?;
            bindings.insert(tier.clone(), role.trim().to_string());
        }

        if bindings.is_empty() {
            return Err(Error::configuration_field(
                "tier_bindings",
                "at least one tier must be bound to a role",
            ));
        }
        Ok(bindings)
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::configuration_field(field, "must not be empty"));
    }
    Ok(())
}

fn validate_base_url(raw: &str) -> Result<Url> {
    if raw.trim().is_empty() {
        return Err(Error::configuration_field("base_url", "must not be empty"));
    }
    let url = Url::parse(raw.trim()).map_err(|e| {
        Error::configuration_field(
            "base_url",
            format!("'{}' is not a valid URL: {}", raw, e),
        )
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::configuration_field(
            "base_url",
            format!("'{}' must use http:// or https://", raw),
        ));
    }
    if url.host_str().is_none() {
        return Err(Error::configuration_field(
            "base_url",
            format!("'{}' has no host", raw),
        ));
    }
    Ok(url)
}

fn validate_tier_name(field: &str, tier: &str) -> Result<()> {
    let valid = !tier.is_empty()
        && tier
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if !valid {
        return Err(Error::configuration_field(
            field,
            "tier names must be lower-case letters, digits, '-' or '_'",
        ));
    }
    Ok(())
}

/// Validated configuration, loaded fresh for every issuance and revocation
#[derive(Clone, PartialEq, Eq)]
pub struct Configuration {
    /// Upper bound on any lease
    pub max_ttl: Duration,
    /// Lease TTL used when the caller asks for none
    pub default_ttl: Duration,
    /// API server URL of the target cluster
    pub cluster_host: Url,
    /// PEM CA bundle trusted for the target cluster
    pub ca_cert: String,
    /// Bearer token of the administrative identity
    pub admin_credential: String,
    /// Tier name to role name
    pub tier_bindings: BTreeMap<String, String>,
    /// Kind of role the bindings reference
    pub role_kind: BindingKind,
    /// Bound on waiting for an identity's token
    pub credential_wait: Duration,
    /// Interval between token lookups
    pub credential_poll_interval: Duration,
}

impl Configuration {
    /// Map a caller tier (case-insensitive) to its role name
    pub fn resolve_tier(&self, tier: &str) -> Result<&str> {
        let normalized = tier.trim().to_ascii_lowercase();
        self.tier_bindings
            .get(&normalized)
            .map(String::as_str)
            .ok_or_else(|| Error::tier_not_allowed(tier, self.allowed_tiers()))
    }

    /// Tiers callers may request, sorted
    pub fn allowed_tiers(&self) -> Vec<String> {
        self.tier_bindings.keys().cloned().collect()
    }

    /// API server URL without a trailing slash
    pub fn server(&self) -> &str {
        self.cluster_host.as_str().trim_end_matches('/')
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("max_ttl", &self.max_ttl)
            .field("default_ttl", &self.default_ttl)
            .field("cluster_host", &self.cluster_host.as_str())
            .field("admin_credential", &REDACTED)
            .field("tier_bindings", &self.tier_bindings)
            .field("role_kind", &self.role_kind)
            .field("credential_wait", &self.credential_wait)
            .finish_non_exhaustive()
    }
}
