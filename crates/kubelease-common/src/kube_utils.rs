//! Shared Kubernetes utilities using kube-rs

use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::kubeconfig::TokenKubeconfig;
use crate::Error;

/// Default connection timeout for clients of the target cluster
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for clients of the target cluster
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP status code of a kube API error, if the server answered
pub fn api_status(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(ae) => Some(ae.code),
        _ => None,
    }
}

/// Whether the API server reported the object as already existing
pub fn is_conflict(err: &kube::Error) -> bool {
    api_status(err) == Some(409)
}

/// Create a kube client for a cluster reached with a bearer token
///
/// Only `ca_cert_pem` is trusted for the server certificate. The client is
/// built through a rendered kubeconfig so that TLS and auth handling are
/// exactly those kube-rs applies to any kubeconfig.
pub async fn create_token_client(
    server: &str,
    ca_cert_pem: &str,
    token: &str,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let yaml = TokenKubeconfig {
        name: "kubelease-admin",
        server,
        ca_cert_pem,
        token,
        namespace: None,
    }
    .to_yaml()?;

    let kubeconfig = Kubeconfig::from_yaml(&yaml).map_err(|e| {
        Error::configuration(format!("failed to parse admin kubeconfig: {}", e))
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::configuration_field("ca_cert", format!("failed to load cluster config: {}", e))
        })?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);

    Client::try_from(config).map_err(|e| {
        Error::configuration_field("base_url", format!("failed to create client: {}", e))
    })
}
