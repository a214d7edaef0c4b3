//! In-memory target cluster
//!
//! A [`ClusterClient`] that keeps namespaces, identities and bindings in
//! process and records every call. Failures and hangs can be injected per
//! operation, which makes it the workhorse of the integration tests and of
//! the server's `--cluster memory` mode. A hang can strike before a create
//! takes effect or after it, the latter standing in for a response lost
//! after the API server committed the object.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use kubelease_common::{Error, Operation, ResourceRef, Result};

use crate::client::{
    BindingInfo, ClusterClient, GeneratedResource, IdentityCredential, IdentityInfo,
    NamespaceStatus,
};
use crate::config::BindingKind;

/// A call received by the in-memory cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    /// `ensure_namespace(name)`
    EnsureNamespace(String),
    /// `create_identity(namespace, name)`
    CreateIdentity(String, String),
    /// `fetch_identity_credentials(namespace, identity)`
    FetchCredentials(String, String),
    /// `delete_identity(namespace, name)`
    DeleteIdentity(String, String),
    /// `create_binding(namespace, name, identity, role)`
    CreateBinding(String, String, String, String),
    /// `delete_binding(namespace, name)`
    DeleteBinding(String, String),
}

impl Call {
    /// Operation this call performs
    pub fn operation(&self) -> Operation {
        match self {
            Call::EnsureNamespace(_) => Operation::EnsureNamespace,
            Call::CreateIdentity(..) => Operation::CreateIdentity,
            Call::FetchCredentials(..) => Operation::FetchCredentials,
            Call::DeleteIdentity(..) => Operation::DeleteIdentity,
            Call::CreateBinding(..) => Operation::CreateBinding,
            Call::DeleteBinding(..) => Operation::DeleteBinding,
        }
    }

    /// Shorthand for building an expected call in assertions
    pub fn delete_identity(namespace: &str, name: &str) -> Self {
        Call::DeleteIdentity(namespace.to_string(), name.to_string())
    }

    /// Shorthand for building an expected call in assertions
    pub fn delete_binding(namespace: &str, name: &str) -> Self {
        Call::DeleteBinding(namespace.to_string(), name.to_string())
    }
}

#[derive(Clone, Debug)]
struct InjectedFailure {
    status: u16,
    message: String,
    remaining: Option<usize>,
}

#[derive(Clone, Debug)]
struct StoredBinding {
    identity: String,
    role: String,
    kind: BindingKind,
}

#[derive(Debug)]
struct State {
    namespaces: BTreeSet<String>,
    identities: BTreeMap<(String, String), String>,
    bindings: BTreeMap<(String, String), StoredBinding>,
    identity_names: VecDeque<String>,
    binding_names: VecDeque<String>,
    next_suffix: u64,
    failures: HashMap<Operation, InjectedFailure>,
    hangs: HashSet<Operation>,
    hangs_after_commit: HashSet<Operation>,
    credentials_per_identity: usize,
    credentials_after_fetches: usize,
    fetches: HashMap<(String, String), usize>,
    calls: Vec<Call>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            namespaces: BTreeSet::new(),
            identities: BTreeMap::new(),
            bindings: BTreeMap::new(),
            identity_names: VecDeque::new(),
            binding_names: VecDeque::new(),
            next_suffix: 0,
            failures: HashMap::new(),
            hangs: HashSet::new(),
            hangs_after_commit: HashSet::new(),
            credentials_per_identity: 1,
            credentials_after_fetches: 0,
            fetches: HashMap::new(),
            calls: Vec::new(),
        }
    }
}

impl State {
    fn next_name(&mut self, resource: GeneratedResource) -> String {
        let scripted = match resource {
            GeneratedResource::Identity => self.identity_names.pop_front(),
            GeneratedResource::Binding => self.binding_names.pop_front(),
        };
        scripted.unwrap_or_else(|| {
            self.next_suffix += 1;
            format!("{}{:05}", resource.prefix(), self.next_suffix)
        })
    }

    fn injected(&mut self, op: Operation, resource: &ResourceRef) -> Option<Error> {
        let failure = self.failures.get_mut(&op)?;
        let err = Error::remote_with_status(op, resource, failure.status, failure.message.clone());
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.failures.remove(&op);
            }
        }
        Some(err)
    }
}

enum Outcome {
    Proceed,
    Hang,
}

/// Shared in-memory cluster; clones observe the same state
#[derive(Clone, Debug, Default)]
pub struct InMemoryCluster {
    state: Arc<Mutex<State>>,
}

impl InMemoryCluster {
    /// An empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create a namespace
    pub fn with_namespace(self, name: &str) -> Self {
        self.state.lock().namespaces.insert(name.to_string());
        self
    }

    /// Names handed out, in order, for the next identities
    pub fn with_identity_names<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .lock()
            .identity_names
            .extend(names.into_iter().map(Into::into));
        self
    }

    /// Names handed out, in order, for the next bindings
    pub fn with_binding_names<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .lock()
            .binding_names
            .extend(names.into_iter().map(Into::into));
        self
    }

    /// Number of credentials every identity ends up with
    pub fn with_credentials_per_identity(self, count: usize) -> Self {
        self.state.lock().credentials_per_identity = count;
        self
    }

    /// Report no credentials for the first `fetches` lookups of each identity
    pub fn with_credentials_after_fetches(self, fetches: usize) -> Self {
        self.state.lock().credentials_after_fetches = fetches;
        self
    }

    /// Fail every call of `op` with the given HTTP status
    pub fn fail(&self, op: Operation, status: u16, message: &str) {
        self.state.lock().failures.insert(
            op,
            InjectedFailure {
                status,
                message: message.to_string(),
                remaining: None,
            },
        );
    }

    /// Fail only the next `times` calls of `op`
    pub fn fail_times(&self, op: Operation, times: usize, status: u16, message: &str) {
        if times == 0 {
            return;
        }
        self.state.lock().failures.insert(
            op,
            InjectedFailure {
                status,
                message: message.to_string(),
                remaining: Some(times),
            },
        );
    }

    /// Make every call of `op` block forever
    pub fn hang(&self, op: Operation) {
        self.state.lock().hangs.insert(op);
    }

    /// Let every create of `op` take effect, then block forever
    pub fn hang_after_commit(&self, op: Operation) {
        self.state.lock().hangs_after_commit.insert(op);
    }

    /// Every call received so far, in order
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Calls of one operation, in order
    pub fn calls_of(&self, op: Operation) -> Vec<Call> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.operation() == op)
            .cloned()
            .collect()
    }

    /// Number of identities that currently exist
    pub fn identity_count(&self) -> usize {
        self.state.lock().identities.len()
    }

    /// Number of bindings that currently exist
    pub fn binding_count(&self) -> usize {
        self.state.lock().bindings.len()
    }

    /// Whether `namespace/name` is an existing identity
    pub fn has_identity(&self, namespace: &str, name: &str) -> bool {
        self.state
            .lock()
            .identities
            .contains_key(&(namespace.to_string(), name.to_string()))
    }

    /// Whether `namespace/name` is an existing binding
    pub fn has_binding(&self, namespace: &str, name: &str) -> bool {
        self.state
            .lock()
            .bindings
            .contains_key(&(namespace.to_string(), name.to_string()))
    }

    /// Role and subject of an existing binding
    pub fn binding(&self, namespace: &str, name: &str) -> Option<(String, String, BindingKind)> {
        self.state
            .lock()
            .bindings
            .get(&(namespace.to_string(), name.to_string()))
            .map(|b| (b.identity.clone(), b.role.clone(), b.kind))
    }

    /// Existing namespaces, sorted
    pub fn namespaces(&self) -> Vec<String> {
        self.state.lock().namespaces.iter().cloned().collect()
    }

    fn begin(&self, call: Call, resource: &ResourceRef) -> Result<Outcome> {
        let mut state = self.state.lock();
        let op = call.operation();
        state.calls.push(call);
        if state.hangs.contains(&op) {
            return Ok(Outcome::Hang);
        }
        match state.injected(op, resource) {
            Some(err) => Err(err),
            None => Ok(Outcome::Proceed),
        }
    }

    async fn enter(&self, call: Call, resource: &ResourceRef) -> Result<()> {
        if let Outcome::Hang = self.begin(call, resource)? {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn committed(&self, op: Operation) {
        let hang = self.state.lock().hangs_after_commit.contains(&op);
        if hang {
            std::future::pending::<()>().await;
        }
    }
}

fn conflict(op: Operation, resource: &ResourceRef) -> Error {
    Error::remote_with_status(op, resource, 409, format!("{} already exists", resource))
}

fn not_found(op: Operation, resource: &ResourceRef) -> Error {
    Error::remote_with_status(op, resource, 404, format!("{} not found", resource))
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    fn generate_name(&self, resource: GeneratedResource) -> String {
        self.state.lock().next_name(resource)
    }

    async fn ensure_namespace(&self, name: &str) -> Result<NamespaceStatus> {
        let resource = ResourceRef::namespace(name);
        self.enter(Call::EnsureNamespace(name.to_string()), &resource)
            .await?;

        let created = self.state.lock().namespaces.insert(name.to_string());
        Ok(NamespaceStatus {
            name: name.to_string(),
            already_existed: !created,
        })
    }

    async fn create_identity(&self, namespace: &str, name: &str) -> Result<IdentityInfo> {
        let resource = ResourceRef::identity(namespace, name);
        self.enter(
            Call::CreateIdentity(namespace.to_string(), name.to_string()),
            &resource,
        )
        .await?;

        let identity = {
            let mut state = self.state.lock();
            if !state.namespaces.contains(namespace) {
                return Err(not_found(
                    Operation::CreateIdentity,
                    &ResourceRef::namespace(namespace),
                ));
            }
            let key = (namespace.to_string(), name.to_string());
            if state.identities.contains_key(&key) {
                return Err(conflict(Operation::CreateIdentity, &resource));
            }
            let uid = format!("uid-{}", name);
            state.identities.insert(key, uid.clone());
            IdentityInfo {
                name: name.to_string(),
                uid,
            }
        };
        self.committed(Operation::CreateIdentity).await;
        Ok(identity)
    }

    async fn fetch_identity_credentials(
        &self,
        namespace: &str,
        identity: &str,
    ) -> Result<Vec<IdentityCredential>> {
        let resource = ResourceRef::identity(namespace, identity);
        self.enter(
            Call::FetchCredentials(namespace.to_string(), identity.to_string()),
            &resource,
        )
        .await?;

        let mut state = self.state.lock();
        let key = (namespace.to_string(), identity.to_string());
        if !state.identities.contains_key(&key) {
            return Ok(Vec::new());
        }
        let after = state.credentials_after_fetches;
        let count = state.credentials_per_identity;
        let seen = state.fetches.entry(key).or_insert(0);
        *seen += 1;
        if *seen <= after {
            return Ok(Vec::new());
        }
        Ok((0..count)
            .map(|i| IdentityCredential {
                ca_cert: "in-memory-ca".to_string(),
                namespace: namespace.to_string(),
                token: format!("token-{}-{}", identity, i),
            })
            .collect())
    }

    async fn delete_identity(&self, namespace: &str, name: &str) -> Result<()> {
        let resource = ResourceRef::identity(namespace, name);
        self.enter(
            Call::DeleteIdentity(namespace.to_string(), name.to_string()),
            &resource,
        )
        .await?;

        let removed = self
            .state
            .lock()
            .identities
            .remove(&(namespace.to_string(), name.to_string()));
        match removed {
            Some(_) => Ok(()),
            None => Err(not_found(Operation::DeleteIdentity, &resource)),
        }
    }

    async fn create_binding(
        &self,
        namespace: &str,
        name: &str,
        identity: &str,
        role: &str,
        kind: BindingKind,
    ) -> Result<BindingInfo> {
        let resource = ResourceRef::binding(namespace, name);
        self.enter(
            Call::CreateBinding(
                namespace.to_string(),
                name.to_string(),
                identity.to_string(),
                role.to_string(),
            ),
            &resource,
        )
        .await?;

        {
            let mut state = self.state.lock();
            if !state.namespaces.contains(namespace) {
                return Err(not_found(
                    Operation::CreateBinding,
                    &ResourceRef::namespace(namespace),
                ));
            }
            let key = (namespace.to_string(), name.to_string());
            if state.bindings.contains_key(&key) {
                return Err(conflict(Operation::CreateBinding, &resource));
            }
            state.bindings.insert(
                key,
                StoredBinding {
                    identity: identity.to_string(),
                    role: role.to_string(),
                    kind,
                },
            );
        }
        self.committed(Operation::CreateBinding).await;
        Ok(BindingInfo {
            name: name.to_string(),
            uid: format!("uid-{}", name),
        })
    }

    async fn delete_binding(&self, namespace: &str, name: &str) -> Result<()> {
        let resource = ResourceRef::binding(namespace, name);
        self.enter(
            Call::DeleteBinding(namespace.to_string(), name.to_string()),
            &resource,
        )
        .await?;

        let removed = self
            .state
            .lock()
            .bindings
            .remove(&(namespace.to_string(), name.to_string()));
        match removed {
            Some(_) => Ok(()),
            None => Err(not_found(Operation::DeleteBinding, &resource)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use kubelease_common::{BINDING_NAME_PREFIX, IDENTITY_NAME_PREFIX};
    use std::time::Duration;

    #[tokio::test]
    async fn scripted_names_are_used_before_generated_ones() {
        let cluster = InMemoryCluster::new()
            .with_namespace("team-a")
            .with_identity_names(["id-123"]);

        let first = cluster.generate_name(GeneratedResource::Identity);
        let second = cluster.generate_name(GeneratedResource::Identity);
        assert_eq!(first, "id-123");
        assert!(second.starts_with(IDENTITY_NAME_PREFIX));
        assert!(cluster
            .generate_name(GeneratedResource::Binding)
            .starts_with(BINDING_NAME_PREFIX));

        cluster.create_identity("team-a", &first).await.unwrap();
        cluster.create_identity("team-a", &second).await.unwrap();
        assert_eq!(cluster.identity_count(), 2);
    }

    #[tokio::test]
    async fn creating_an_existing_name_conflicts() {
        let cluster = InMemoryCluster::new().with_namespace("team-a");
        cluster.create_identity("team-a", "sa").await.unwrap();
        let err = cluster.create_identity("team-a", "sa").await.unwrap_err();
        assert!(matches!(
            err,
            Error::RemoteResource {
                status: Some(409),
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn hang_after_commit_keeps_the_created_resource() {
        let cluster = InMemoryCluster::new().with_namespace("team-a");
        cluster.hang_after_commit(Operation::CreateBinding);

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            cluster.create_binding("team-a", "rb-1", "sa", "view", BindingKind::ClusterRole),
        )
        .await;
        assert!(outcome.is_err());
        assert!(cluster.has_binding("team-a", "rb-1"));
    }

    #[tokio::test]
    async fn ensure_namespace_reports_prior_existence() {
        let cluster = InMemoryCluster::new().with_namespace("existing");
        assert!(cluster.ensure_namespace("existing").await.unwrap().already_existed);
        assert!(!cluster.ensure_namespace("fresh").await.unwrap().already_existed);
        assert!(cluster.ensure_namespace("fresh").await.unwrap().already_existed);
    }

    #[tokio::test]
    async fn deleting_a_missing_resource_is_not_found() {
        let cluster = InMemoryCluster::new();
        let err = cluster.delete_binding("team-a", "rb-1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn credentials_appear_after_the_configured_fetches() {
        let cluster = InMemoryCluster::new()
            .with_namespace("team-a")
            .with_credentials_after_fetches(2);
        cluster.create_identity("team-a", "sa").await.unwrap();

        assert!(cluster.fetch_identity_credentials("team-a", "sa").await.unwrap().is_empty());
        assert!(cluster.fetch_identity_credentials("team-a", "sa").await.unwrap().is_empty());
        let creds = cluster.fetch_identity_credentials("team-a", "sa").await.unwrap();
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].namespace, "team-a");
    }

    #[tokio::test]
    async fn injected_failures_can_be_limited() {
        let cluster = InMemoryCluster::new().with_namespace("team-a");
        cluster.fail_times(Operation::CreateIdentity, 1, 500, "etcd unavailable");

        let err = cluster.create_identity("team-a", "sa").await.unwrap_err();
        assert!(matches!(
            err,
            Error::RemoteResource {
                status: Some(500),
                operation: Operation::CreateIdentity,
                ..
            }
        ));
        assert!(cluster.create_identity("team-a", "sa").await.is_ok());
        assert_eq!(cluster.calls_of(Operation::CreateIdentity).len(), 2);
    }
}
