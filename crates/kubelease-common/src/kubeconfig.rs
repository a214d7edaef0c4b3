//! Kubeconfig rendering
//!
//! Builds single-context, bearer-token kubeconfigs. Used both for the
//! admin connection to the target cluster and for the kubeconfig handed
//! back to callers alongside an issued service account token.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Kubeconfig structure
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// API version
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Kind (always "Config")
    pub kind: String,
    /// Clusters
    pub clusters: Vec<KubeconfigCluster>,
    /// Users
    pub users: Vec<KubeconfigUser>,
    /// Contexts
    pub contexts: Vec<KubeconfigContext>,
    /// Current context
    pub current_context: String,
}

/// Cluster entry in kubeconfig
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct KubeconfigCluster {
    /// Cluster name
    pub name: String,
    /// Cluster config
    pub cluster: ClusterConfig,
}

/// Cluster configuration
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// API server URL
    pub server: String,
    /// CA certificate (base64 encoded PEM)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
}

/// User entry in kubeconfig
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct KubeconfigUser {
    /// User name
    pub name: String,
    /// User config
    pub user: UserConfig,
}

/// User configuration
#[derive(Serialize, Deserialize, PartialEq)]
pub struct UserConfig {
    /// Bearer token
    pub token: String,
}

impl fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserConfig")
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Context entry in kubeconfig
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct KubeconfigContext {
    /// Context name
    pub name: String,
    /// Context config
    pub context: ContextConfig,
}

/// Context configuration
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ContextConfig {
    /// Cluster name (reference)
    pub cluster: String,
    /// User name (reference)
    pub user: String,
    /// Default namespace for the context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Inputs for a single-context token kubeconfig
#[derive(Clone)]
pub struct TokenKubeconfig<'a> {
    /// Name used for the cluster, user and context entries
    pub name: &'a str,
    /// API server URL
    pub server: &'a str,
    /// PEM CA bundle; omitted from the output when empty
    pub ca_cert_pem: &'a str,
    /// Bearer token
    pub token: &'a str,
    /// Default namespace for the context
    pub namespace: Option<&'a str>,
}

impl fmt::Debug for TokenKubeconfig<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenKubeconfig")
            .field("name", &self.name)
            .field("server", &self.server)
            .field("ca_cert_pem", &format_args!("<{} bytes>", self.ca_cert_pem.len()))
            .field("token", &"<redacted>")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl TokenKubeconfig<'_> {
    /// Build the kubeconfig structure
    pub fn build(&self) -> Kubeconfig {
        let ca = (!self.ca_cert_pem.is_empty()).then(|| STANDARD.encode(self.ca_cert_pem));
        Kubeconfig {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![KubeconfigCluster {
                name: self.name.to_string(),
                cluster: ClusterConfig {
                    server: self.server.to_string(),
                    certificate_authority_data: ca,
                },
            }],
            users: vec![KubeconfigUser {
                name: self.name.to_string(),
                user: UserConfig {
                    token: self.token.to_string(),
                },
            }],
            contexts: vec![KubeconfigContext {
                name: self.name.to_string(),
                context: ContextConfig {
                    cluster: self.name.to_string(),
                    user: self.name.to_string(),
                    namespace: self.namespace.map(str::to_string),
                },
            }],
            current_context: self.name.to_string(),
        }
    }

    /// Render the kubeconfig as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.build())
            .map_err(|e| Error::configuration(format!("failed to render kubeconfig: {}", e)))
    }
}
