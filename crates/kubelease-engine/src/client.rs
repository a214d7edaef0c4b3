//! Target cluster abstraction
//!
//! Issuance and revocation talk to the target cluster only through
//! [`ClusterClient`], so tests can substitute a mock or the in-memory
//! cluster while production uses the kube-rs implementation. A
//! [`ClusterConnector`] turns the validated configuration into a client,
//! once per request, so configuration changes take effect immediately.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;

#[cfg(test)]
use mockall::automock;

use kubelease_common::{Result, BINDING_NAME_PREFIX, IDENTITY_NAME_PREFIX};

use crate::config::{BindingKind, Configuration};

/// Outcome of a create-if-absent on a namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceStatus {
    /// Namespace name
    pub name: String,
    /// False when this call created the namespace
    pub already_existed: bool,
}

/// Resources created under a generated name
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GeneratedResource {
    /// Service account
    Identity,
    /// Role binding
    Binding,
}

impl GeneratedResource {
    /// Prefix of every generated name of this kind
    pub fn prefix(self) -> &'static str {
        match self {
            GeneratedResource::Identity => IDENTITY_NAME_PREFIX,
            GeneratedResource::Binding => BINDING_NAME_PREFIX,
        }
    }
}

/// Characters the API server uses for `generateName` suffixes
const NAME_SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const NAME_SUFFIX_LEN: usize = 5;

/// `prefix` followed by a random suffix in the API server's style
pub fn random_name(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| NAME_SUFFIX_ALPHABET[rng.gen_range(0..NAME_SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("{}{}", prefix, suffix)
}

/// A service account created for one lease
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityInfo {
    /// Name
    pub name: String,
    /// Server-assigned uid
    pub uid: String,
}

/// Token material bound to an identity
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityCredential {
    /// CA certificate of the cluster, PEM encoded
    pub ca_cert: String,
    /// Namespace recorded in the credential
    pub namespace: String,
    /// Bearer token
    pub token: String,
}

impl std::fmt::Debug for IdentityCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCredential")
            .field("namespace", &self.namespace)
            .field("ca_cert", &format_args!("<{} bytes>", self.ca_cert.len()))
            .field("token", &"<redacted>")
            .finish()
    }
}

/// A role binding created for one lease
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingInfo {
    /// Name
    pub name: String,
    /// Server-assigned uid
    pub uid: String,
}

/// Operations against the target cluster
///
/// Every method is a single remote round trip. Failures are reported as
/// `Error::RemoteResource` carrying the operation and resource, with the
/// HTTP status when the API server returned one.
///
/// Names of created resources are chosen by the caller through
/// [`ClusterClient::generate_name`] before the create call, so a create
/// whose response never arrives can still be cleaned up by name.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// A fresh, probably unused name for a resource about to be created
    fn generate_name(&self, resource: GeneratedResource) -> String;

    /// Create `name` unless it exists; reports whether it already did
    async fn ensure_namespace(&self, name: &str) -> Result<NamespaceStatus>;

    /// Create the service account `name`
    async fn create_identity(&self, namespace: &str, name: &str) -> Result<IdentityInfo>;

    /// All credentials currently bound to `identity`
    ///
    /// An empty list means the token controller has not populated one yet.
    async fn fetch_identity_credentials(
        &self,
        namespace: &str,
        identity: &str,
    ) -> Result<Vec<IdentityCredential>>;

    /// Delete a service account
    async fn delete_identity(&self, namespace: &str, name: &str) -> Result<()>;

    /// Bind `role` to `identity` through the role binding `name`
    async fn create_binding(
        &self,
        namespace: &str,
        name: &str,
        identity: &str,
        role: &str,
        kind: BindingKind,
    ) -> Result<BindingInfo>;

    /// Delete a role binding
    async fn delete_binding(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Builds a [`ClusterClient`] for the configured target cluster
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Connect using the cluster host, CA and admin credential in `config`
    async fn connect(&self, config: &Configuration) -> Result<Arc<dyn ClusterClient>>;
}

/// Connector that always hands out the same client
///
/// Used with [`crate::memory::InMemoryCluster`] and in tests.
#[derive(Clone)]
pub struct StaticConnector {
    client: Arc<dyn ClusterClient>,
}

impl StaticConnector {
    /// Hand out `client` on every connect
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterConnector for StaticConnector {
    async fn connect(&self, _config: &Configuration) -> Result<Arc<dyn ClusterClient>> {
        Ok(self.client.clone())
    }
}
