//! kube-rs implementation of [`ClusterClient`]
//!
//! Identities are ServiceAccounts named
//! [`kubelease_common::IDENTITY_NAME_PREFIX`] plus a random suffix chosen
//! before the create call. Clusters no longer mint long-lived token Secrets
//! on their own, so each identity gets an explicit
//! `kubernetes.io/service-account-token` Secret owned by the ServiceAccount;
//! the token controller fills it in and garbage collection removes it with
//! the identity.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams, PropagationPolicy};
use kube::Client;
use tracing::{debug, info, warn};

use kubelease_common::kube_utils::{
    create_token_client, is_conflict, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT,
};
use kubelease_common::{
    Error, Operation, ResourceRef, Result, LABEL_MANAGED_BY, LABEL_MANAGED_BY_KUBELEASE,
};

use crate::client::{
    random_name, BindingInfo, ClusterClient, ClusterConnector, GeneratedResource,
    IdentityCredential, IdentityInfo, NamespaceStatus,
};
use crate::config::{BindingKind, Configuration};

/// Secret type populated by the token controller
pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

/// Annotation linking a token Secret to its ServiceAccount
pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_KUBELEASE.to_string(),
    )])
}

/// ServiceAccount `name`
pub fn build_identity(namespace: &str, name: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Token Secret for `identity`, owned by it
pub fn build_token_secret(namespace: &str, identity: &IdentityInfo) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(format!("{}-token", identity.name)),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels()),
            annotations: Some(BTreeMap::from([(
                SERVICE_ACCOUNT_NAME_ANNOTATION.to_string(),
                identity.name.clone(),
            )])),
            owner_references: Some(vec![OwnerReference {
                api_version: "v1".to_string(),
                kind: "ServiceAccount".to_string(),
                name: identity.name.clone(),
                uid: identity.uid.clone(),
                controller: Some(true),
                block_owner_deletion: None,
            }]),
            ..Default::default()
        },
        type_: Some(SERVICE_ACCOUNT_TOKEN_TYPE.to_string()),
        ..Default::default()
    }
}

/// RoleBinding `name` of `role` to `identity`
pub fn build_binding(
    namespace: &str,
    name: &str,
    identity: &str,
    role: &str,
    kind: BindingKind,
) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: kind.as_str().to_string(),
            name: role.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: identity.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

/// Extract the credential from a token Secret belonging to `identity`
///
/// Returns `None` for Secrets of another identity or ones the token
/// controller has not populated yet.
pub fn credential_from_secret(secret: &Secret, identity: &str) -> Option<IdentityCredential> {
    let owner = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SERVICE_ACCOUNT_NAME_ANNOTATION));
    if owner.map(String::as_str) != Some(identity) {
        return None;
    }

    let data = secret.data.as_ref()?;
    let field = |key: &str| {
        data.get(key)
            .and_then(|v| String::from_utf8(v.0.clone()).ok())
    };
    let token = field("token").filter(|t| !t.is_empty())?;
    Some(IdentityCredential {
        token,
        ca_cert: field("ca.crt").unwrap_or_default(),
        namespace: field("namespace")
            .or_else(|| secret.metadata.namespace.clone())
            .unwrap_or_default(),
    })
}

fn server_uid(meta: &ObjectMeta, operation: Operation, resource: &ResourceRef) -> Result<String> {
    meta.uid.clone().ok_or_else(|| {
        Error::remote(operation, resource, "API server response is missing the uid")
    })
}

/// [`ClusterClient`] backed by a kube-rs [`Client`]
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap an already authenticated client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn delete_params() -> DeleteParams {
        DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    fn generate_name(&self, resource: GeneratedResource) -> String {
        random_name(resource.prefix())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<NamespaceStatus> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let resource = ResourceRef::namespace(name);

        let existing = api
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(Operation::EnsureNamespace, &resource, &e))?;
        if existing.is_some() {
            return Ok(NamespaceStatus {
                name: name.to_string(),
                already_existed: true,
            });
        }

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(managed_labels()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(namespace = %name, "Created namespace");
                Ok(NamespaceStatus {
                    name: name.to_string(),
                    already_existed: false,
                })
            }
            // Lost a race with another creator
            Err(e) if is_conflict(&e) => Ok(NamespaceStatus {
                name: name.to_string(),
                already_existed: true,
            }),
            Err(e) => Err(Error::from_kube(Operation::EnsureNamespace, &resource, &e)),
        }
    }

    async fn create_identity(&self, namespace: &str, name: &str) -> Result<IdentityInfo> {
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let resource = ResourceRef::identity(namespace, name);

        let created = accounts
            .create(&PostParams::default(), &build_identity(namespace, name))
            .await
            .map_err(|e| Error::from_kube(Operation::CreateIdentity, &resource, &e))?;
        let identity = IdentityInfo {
            name: name.to_string(),
            uid: server_uid(&created.metadata, Operation::CreateIdentity, &resource)?,
        };
        debug!(namespace, identity = %identity.name, "Created service account");

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = build_token_secret(namespace, &identity);
        if let Err(e) = secrets.create(&PostParams::default(), &secret).await {
            let err = Error::from_kube(Operation::CreateIdentity, &resource, &e);
            // A rejected create leaves nothing for the caller to roll back
            if let Err(cleanup) = accounts
                .delete(&identity.name, &Self::delete_params())
                .await
            {
                warn!(
                    namespace,
                    identity = %identity.name,
                    error = %cleanup,
                    "Failed to delete service account after token secret creation failed"
                );
            }
            return Err(err);
        }

        Ok(identity)
    }

    async fn fetch_identity_credentials(
        &self,
        namespace: &str,
        identity: &str,
    ) -> Result<Vec<IdentityCredential>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().fields(&format!("type={}", SERVICE_ACCOUNT_TOKEN_TYPE));

        let list = secrets.list(&params).await.map_err(|e| {
            Error::from_kube(
                Operation::FetchCredentials,
                ResourceRef::identity(namespace, identity),
                &e,
            )
        })?;
        Ok(list
            .items
            .iter()
            .filter_map(|s| credential_from_secret(s, identity))
            .collect())
    }

    async fn delete_identity(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &Self::delete_params())
            .await
            .map_err(|e| {
                Error::from_kube(
                    Operation::DeleteIdentity,
                    ResourceRef::identity(namespace, name),
                    &e,
                )
            })?;
        debug!(namespace, identity = %name, "Deleted service account");
        Ok(())
    }

    async fn create_binding(
        &self,
        namespace: &str,
        name: &str,
        identity: &str,
        role: &str,
        kind: BindingKind,
    ) -> Result<BindingInfo> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        let resource = ResourceRef::binding(namespace, name);

        let created = api
            .create(
                &PostParams::default(),
                &build_binding(namespace, name, identity, role, kind),
            )
            .await
            .map_err(|e| Error::from_kube(Operation::CreateBinding, &resource, &e))?;
        let uid = server_uid(&created.metadata, Operation::CreateBinding, &resource)?;
        debug!(namespace, identity, binding = %name, role, "Created role binding");
        Ok(BindingInfo {
            name: name.to_string(),
            uid,
        })
    }

    async fn delete_binding(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &Self::delete_params())
            .await
            .map_err(|e| {
                Error::from_kube(
                    Operation::DeleteBinding,
                    ResourceRef::binding(namespace, name),
                    &e,
                )
            })?;
        debug!(namespace, binding = %name, "Deleted role binding");
        Ok(())
    }
}

/// Connects to the configured cluster with the admin bearer token
#[derive(Clone, Debug)]
pub struct KubeConnector {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl Default for KubeConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl KubeConnector {
    /// Connector with explicit HTTP timeouts
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }
}

/// Reject a CA bundle without a single PEM certificate before handing it to TLS
fn check_ca_bundle(ca_cert: &str) -> Result<()> {
    let blocks = pem::parse_many(ca_cert.as_bytes()).map_err(|e| {
        Error::configuration_field("ca_cert", format!("invalid PEM: {}", e))
    })?;
    if !blocks.iter().any(|b| b.tag() == "CERTIFICATE") {
        return Err(Error::configuration_field(
            "ca_cert",
            "no CERTIFICATE block found",
        ));
    }
    Ok(())
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, config: &Configuration) -> Result<Arc<dyn ClusterClient>> {
        check_ca_bundle(&config.ca_cert)?;
        let client = create_token_client(
            config.server(),
            &config.ca_cert,
            &config.admin_credential,
            self.connect_timeout,
            self.read_timeout,
        )
        .await?;
        Ok(Arc::new(KubeClusterClient::new(client)))
    }
}
