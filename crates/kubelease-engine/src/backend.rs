//! Secrets host surface
//!
//! [`Backend`] is what a secrets host drives: configure, read the
//! configuration back, issue a credential and revoke it. It owns no state
//! beyond the configuration store; the host keeps the lease and calls
//! revoke when the lease expires.

use std::sync::Arc;

use kubelease_common::Result;

use crate::client::ClusterConnector;
use crate::config::{ConfigRecord, TierPolicy};
use crate::context::RequestContext;
use crate::issue::{IssuanceOrchestrator, IssueRequest};
use crate::lease::{LeaseDescriptor, RevocationTarget};
use crate::revoke::RevocationHandler;
use crate::storage::Storage;
use crate::store::ConfigStore;

/// Entry point for a secrets host
#[derive(Clone)]
pub struct Backend {
    store: ConfigStore,
    issuer: IssuanceOrchestrator,
    revoker: RevocationHandler,
}

impl Backend {
    /// Build a backend persisting configuration in `storage`
    pub fn new(
        storage: Arc<dyn Storage>,
        policy: TierPolicy,
        connector: Arc<dyn ClusterConnector>,
    ) -> Self {
        let store = ConfigStore::new(storage, policy);
        Self {
            issuer: IssuanceOrchestrator::new(store.clone(), connector.clone()),
            revoker: RevocationHandler::new(store.clone(), connector),
            store,
        }
    }

    /// Validate and store the configuration, replacing any previous one
    pub async fn configure(&self, record: &ConfigRecord) -> Result<()> {
        self.store.write(record).await.map(|_| ())
    }

    /// The stored configuration, admin credential redacted
    pub async fn read_config(&self) -> Result<Option<ConfigRecord>> {
        Ok(self.store.read_record().await?.map(|r| r.redacted()))
    }

    /// The stored configuration exactly as written
    pub async fn read_config_raw(&self) -> Result<Option<ConfigRecord>> {
        self.store.read_record().await
    }

    /// Issue a credential for `tier` in `namespace`
    pub async fn issue_credential(
        &self,
        ctx: &RequestContext,
        tier: &str,
        namespace: &str,
        ttl_seconds: i64,
    ) -> Result<LeaseDescriptor> {
        self.issuer
            .issue(ctx, &IssueRequest::new(tier, namespace, ttl_seconds))
            .await
    }

    /// Revoke a previously issued credential
    pub async fn revoke_credential(
        &self,
        ctx: &RequestContext,
        target: &RevocationTarget,
    ) -> Result<()> {
        self.revoker.revoke(ctx, target).await
    }
}
