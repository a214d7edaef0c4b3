//! Lease descriptors
//!
//! The descriptor is handed to the secrets host on issuance and comes back
//! verbatim on revocation, so its field names are a wire format.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kubelease_common::{Error, Result};

/// Record of one issued credential
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseDescriptor {
    /// Namespace holding the identity and binding
    pub namespace: String,
    /// Server-assigned ServiceAccount name
    pub identity_name: String,
    /// ServiceAccount uid
    pub identity_uid: String,
    /// Server-assigned RoleBinding name
    pub binding_name: String,
    /// RoleBinding uid
    pub binding_uid: String,
    /// Role the binding grants
    pub role_name: String,
    /// Tier the caller requested, normalized
    pub tier: String,
    /// Bearer token of the identity
    pub credential_token: String,
    /// CA certificate of the cluster, PEM encoded
    pub credential_ca_cert: String,
    /// Lease lifetime in seconds
    pub effective_ttl_seconds: u64,
    /// Whether this issuance created the namespace
    #[serde(default)]
    pub namespace_created: bool,
    /// Ready-to-use kubeconfig for the identity
    #[serde(default)]
    pub kubeconfig: String,
    /// Leases are never renewable
    #[serde(default)]
    pub renewable: bool,
}

impl LeaseDescriptor {
    /// Lease lifetime
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.effective_ttl_seconds)
    }

    /// Lease options reported to the secrets host
    pub fn lease_options(&self) -> LeaseOptions {
        LeaseOptions {
            ttl_seconds: self.effective_ttl_seconds,
            max_ttl_seconds: self.effective_ttl_seconds,
            renewable: false,
        }
    }
}

impl fmt::Debug for LeaseDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseDescriptor")
            .field("namespace", &self.namespace)
            .field("identity_name", &self.identity_name)
            .field("binding_name", &self.binding_name)
            .field("role_name", &self.role_name)
            .field("tier", &self.tier)
            .field("effective_ttl_seconds", &self.effective_ttl_seconds)
            .field("namespace_created", &self.namespace_created)
            .field("credential_token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// TTL bookkeeping for the secrets host
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseOptions {
    /// Lease lifetime in seconds
    pub ttl_seconds: u64,
    /// Hard upper bound, equal to `ttl_seconds` since leases never renew
    pub max_ttl_seconds: u64,
    /// Always false
    pub renewable: bool,
}

/// The subset of a descriptor revocation needs
///
/// Deserializes from a full [`LeaseDescriptor`]; unknown fields are
/// ignored so older or richer descriptors still revoke.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationTarget {
    /// Namespace holding the identity and binding
    pub namespace: String,
    /// ServiceAccount to delete
    pub identity_name: String,
    /// RoleBinding to delete
    pub binding_name: String,
}

impl RevocationTarget {
    /// Build a target from its parts
    pub fn new(
        namespace: impl Into<String>,
        identity_name: impl Into<String>,
        binding_name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            identity_name: identity_name.into(),
            binding_name: binding_name.into(),
        }
    }

    /// Reject targets that cannot name a single resource
    ///
    /// An empty name would turn a delete into a request against the whole
    /// collection.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("namespace", &self.namespace),
            ("identity_name", &self.identity_name),
            ("binding_name", &self.binding_name),
        ] {
            if value.trim().is_empty() {
                return Err(Error::invalid_lease(field, "must not be empty"));
            }
        }
        Ok(())
    }
}

impl From<&LeaseDescriptor> for RevocationTarget {
    fn from(lease: &LeaseDescriptor) -> Self {
        Self::new(&lease.namespace, &lease.identity_name, &lease.binding_name)
    }
}
