//! Revocation handler
//!
//! Deletes the binding, then the identity. Each delete is attempted once
//! and the first failure is returned without attempting the next one, so a
//! binding that could not be removed leaves its identity in place rather
//! than issuing more destructive calls against a misbehaving cluster.
//! Namespaces are never deleted.

use std::sync::Arc;

use tracing::{info, instrument};

use kubelease_common::Result;

use crate::client::{ClusterClient, ClusterConnector};
use crate::context::RequestContext;
use crate::lease::RevocationTarget;
use crate::store::ConfigStore;

/// Tears down the resources named by a lease
#[derive(Clone)]
pub struct RevocationHandler {
    store: ConfigStore,
    connector: Arc<dyn ClusterConnector>,
}

impl RevocationHandler {
    /// Create a handler reading configuration from `store`
    pub fn new(store: ConfigStore, connector: Arc<dyn ClusterConnector>) -> Self {
        Self { store, connector }
    }

    /// Revoke the lease described by `target`
    #[instrument(
        skip(self, ctx, target),
        fields(
            namespace = %target.namespace,
            identity = %target.identity_name,
            binding = %target.binding_name
        )
    )]
    pub async fn revoke(&self, ctx: &RequestContext, target: &RevocationTarget) -> Result<()> {
        target.validate()?;
        let config = self.store.load().await?;
        let client = self.connector.connect(&config).await?;
        revoke_with(client.as_ref(), ctx, target).await
    }
}

/// Delete binding then identity through an already connected client
pub async fn revoke_with(
    client: &dyn ClusterClient,
    ctx: &RequestContext,
    target: &RevocationTarget,
) -> Result<()> {
    target.validate()?;
    let namespace = target.namespace.as_str();

    ctx.run(
        "delete_binding",
        client.delete_binding(namespace, &target.binding_name),
    )
    .await?;
    ctx.run(
        "delete_identity",
        client.delete_identity(namespace, &target.identity_name),
    )
    .await?;

    info!(
        namespace,
        identity = %target.identity_name,
        binding = %target.binding_name,
        "Credential revoked"
    );
    Ok(())
}
