//! Issuance orchestrator
//!
//! Runs the create pipeline for one lease:
//!
//! 1. load configuration
//! 2. resolve the tier to a role
//! 3. ensure the namespace
//! 4. create the identity
//! 5. wait for its credential
//! 6. bind the role
//! 7. compute the effective TTL
//! 8. assemble the lease descriptor
//!
//! Failures in steps 1-2 are returned as-is and touch nothing remote. Any
//! later failure rolls back the binding and identity this call created, in
//! that order, using a context detached from the caller's cancellation, and
//! returns [`Error::Issuance`] carrying the original error plus the rollback
//! outcome. Namespaces created by the pipeline are never rolled back.
//!
//! Names are chosen before each create call and recorded first. A create
//! that was abandoned mid-flight may still have been committed by the API
//! server, so its name stays on the rollback list; one the server rejected
//! outright is dropped from it.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use kubelease_common::kubeconfig::TokenKubeconfig;
use kubelease_common::poll::poll_until;
use kubelease_common::{CompensationReport, Error, IssueStep, ResourceRef, Result};

use crate::client::{ClusterClient, ClusterConnector, GeneratedResource, IdentityCredential};
use crate::config::Configuration;
use crate::context::RequestContext;
use crate::lease::LeaseDescriptor;
use crate::store::ConfigStore;
use crate::ttl;

/// Parameters of one issuance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssueRequest {
    /// Caller-facing tier, matched case-insensitively
    pub tier: String,
    /// Namespace to issue into; passed through unvalidated
    pub namespace: String,
    /// Requested lease TTL in seconds; non-positive means "default"
    pub ttl_seconds: i64,
}

impl IssueRequest {
    /// Build a request
    pub fn new(tier: impl Into<String>, namespace: impl Into<String>, ttl_seconds: i64) -> Self {
        Self {
            tier: tier.into(),
            namespace: namespace.into(),
            ttl_seconds,
        }
    }
}

/// Resources this issuance created, or may have created
#[derive(Debug, Default)]
struct Allocated {
    namespace_created: bool,
    identity: Option<String>,
    binding: Option<String>,
}

/// Whether a failed create may have taken effect anyway
///
/// True when the call was abandoned or no response arrived; an API status
/// means the server decided and nothing was created.
fn may_have_committed(err: &Error) -> bool {
    matches!(
        err,
        Error::Cancelled { .. } | Error::RemoteResource { status: None, .. }
    )
}

/// Creates identities and bindings for leases
#[derive(Clone)]
pub struct IssuanceOrchestrator {
    store: ConfigStore,
    connector: Arc<dyn ClusterConnector>,
}

impl IssuanceOrchestrator {
    /// Create an orchestrator reading configuration from `store`
    pub fn new(store: ConfigStore, connector: Arc<dyn ClusterConnector>) -> Self {
        Self { store, connector }
    }

    /// Issue a credential
    #[instrument(
        skip(self, ctx, request),
        fields(tier = %request.tier, namespace = %request.namespace)
    )]
    pub async fn issue(
        &self,
        ctx: &RequestContext,
        request: &IssueRequest,
    ) -> Result<LeaseDescriptor> {
        let config = self.store.load().await?;
        let role = config.resolve_tier(&request.tier)?.to_string();
        let client = self.connector.connect(&config).await?;

        let mut allocated = Allocated::default();
        match run_pipeline(client.as_ref(), &config, ctx, request, &role, &mut allocated).await {
            Ok(lease) => Ok(lease),
            Err((step, cause)) => {
                let compensation = compensate(
                    client.as_ref(),
                    &request.namespace,
                    &allocated,
                    &ctx.detached(),
                )
                .await;
                if compensation.is_clean() {
                    warn!(%step, error = %cause, %compensation, "Issuance failed, rolled back");
                } else {
                    warn!(
                        %step,
                        error = %cause,
                        %compensation,
                        "Issuance failed and rollback was incomplete, manual cleanup required"
                    );
                }
                Err(Error::issuance(step, cause, compensation))
            }
        }
    }
}

async fn run_pipeline(
    client: &dyn ClusterClient,
    config: &Configuration,
    ctx: &RequestContext,
    request: &IssueRequest,
    role: &str,
    allocated: &mut Allocated,
) -> std::result::Result<LeaseDescriptor, (IssueStep, Error)> {
    let namespace = request.namespace.as_str();

    let ns = ctx
        .run("ensure_namespace", client.ensure_namespace(namespace))
        .await
        .map_err(|e| (IssueStep::EnsureNamespace, e))?;
    if !ns.already_existed {
        allocated.namespace_created = true;
        warn!(
            namespace,
            "Namespace did not exist and was created; it will not be deleted on rollback or revocation"
        );
    }

    let identity_name = client.generate_name(GeneratedResource::Identity);
    allocated.identity = Some(identity_name.clone());
    let identity = match ctx
        .run(
            "create_identity",
            client.create_identity(namespace, &identity_name),
        )
        .await
    {
        Ok(identity) => identity,
        Err(e) => {
            if !may_have_committed(&e) {
                allocated.identity = None;
            }
            return Err((IssueStep::CreateIdentity, e));
        }
    };
    debug!(namespace, identity = %identity.name, "Identity created");

    let credential = wait_for_credential(client, config, ctx, namespace, &identity.name)
        .await
        .map_err(|e| (IssueStep::FetchCredentials, e))?;

    let binding_name = client.generate_name(GeneratedResource::Binding);
    allocated.binding = Some(binding_name.clone());
    let binding = match ctx
        .run(
            "create_binding",
            client.create_binding(
                namespace,
                &binding_name,
                &identity.name,
                role,
                config.role_kind,
            ),
        )
        .await
    {
        Ok(binding) => binding,
        Err(e) => {
            if !may_have_committed(&e) {
                allocated.binding = None;
            }
            return Err((IssueStep::CreateBinding, e));
        }
    };
    debug!(namespace, binding = %binding.name, role, "Binding created");

    let effective = ttl::clamp(
        request.ttl_seconds,
        config.default_ttl.as_secs(),
        config.max_ttl.as_secs(),
    );
    let seconds = i64::try_from(effective)
        .map_err(|_| Error::invalid_ttl(i64::MAX, "effective ttl overflows"))
        .and_then(|s| ttl::to_duration(s).map(|_| s))
        .map_err(|e| (IssueStep::ComputeTtl, e))?;

    let kubeconfig = TokenKubeconfig {
        name: &identity.name,
        server: config.server(),
        ca_cert_pem: &credential.ca_cert,
        token: &credential.token,
        namespace: Some(namespace),
    }
    .to_yaml()
    .map_err(|e| (IssueStep::AssembleLease, e))?;

    let lease = LeaseDescriptor {
        namespace: namespace.to_string(),
        identity_name: identity.name,
        identity_uid: identity.uid,
        binding_name: binding.name,
        binding_uid: binding.uid,
        role_name: role.to_string(),
        tier: request.tier.trim().to_ascii_lowercase(),
        credential_token: credential.token,
        credential_ca_cert: credential.ca_cert,
        effective_ttl_seconds: seconds as u64,
        namespace_created: allocated.namespace_created,
        kubeconfig,
        renewable: false,
    };
    info!(
        namespace,
        identity = %lease.identity_name,
        binding = %lease.binding_name,
        role,
        ttl_secs = lease.effective_ttl_seconds,
        "Credential issued"
    );
    Ok(lease)
}

/// Poll until the identity has exactly one credential
///
/// Each lookup is bounded by whatever is left of the wait, so a hanging
/// lookup ends the wait on time instead of running to the call timeout.
async fn wait_for_credential(
    client: &dyn ClusterClient,
    config: &Configuration,
    ctx: &RequestContext,
    namespace: &str,
    identity: &str,
) -> Result<IdentityCredential> {
    let deadline = Instant::now().checked_add(config.credential_wait);
    let found = poll_until(
        config.credential_wait,
        config.credential_poll_interval,
        ctx.cancel_token(),
        "fetch_credentials",
        move || async move {
            let left = deadline
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(ctx.call_timeout());
            let cut_short = left < ctx.call_timeout();
            let fetch_ctx = ctx.clone().with_call_timeout(left.min(ctx.call_timeout()));
            let fetched = fetch_ctx
                .run(
                    "fetch_credentials",
                    client.fetch_identity_credentials(namespace, identity),
                )
                .await;
            let mut creds = match fetched {
                Ok(creds) => creds,
                // Out of wait rather than a slow call; report it as a timeout
                Err(Error::Cancelled {
                    timed_out: true, ..
                }) if cut_short => return Ok(None),
                Err(e) => return Err(e),
            };
            match creds.len() {
                0 => Ok(None),
                1 => Ok(creds.pop()),
                count => Err(Error::MultipleSecrets {
                    namespace: namespace.to_string(),
                    identity: identity.to_string(),
                    count,
                }),
            }
        },
    )
    .await?;

    found.ok_or_else(|| Error::PropagationTimeout {
        namespace: namespace.to_string(),
        identity: identity.to_string(),
        waited: config.credential_wait,
    })
}

/// Delete what this issuance created, binding first
///
/// A resource that is already gone counts as rolled back.
async fn compensate(
    client: &dyn ClusterClient,
    namespace: &str,
    allocated: &Allocated,
    ctx: &RequestContext,
) -> CompensationReport {
    let mut report = CompensationReport::default();

    if let Some(binding) = &allocated.binding {
        let resource = ResourceRef::binding(namespace, binding);
        match ctx
            .run("delete_binding", client.delete_binding(namespace, binding))
            .await
        {
            Ok(()) => report.rolled_back.push(resource),
            Err(e) if e.is_not_found() => report.rolled_back.push(resource),
            Err(e) => report.failed.push((resource, e.to_string())),
        }
    }

    if let Some(identity) = &allocated.identity {
        let resource = ResourceRef::identity(namespace, identity);
        match ctx
            .run("delete_identity", client.delete_identity(namespace, identity))
            .await
        {
            Ok(()) => report.rolled_back.push(resource),
            Err(e) if e.is_not_found() => report.rolled_back.push(resource),
            Err(e) => report.failed.push((resource, e.to_string())),
        }
    }

    if allocated.namespace_created {
        report.retained.push(ResourceRef::namespace(namespace));
    }
    report
}
