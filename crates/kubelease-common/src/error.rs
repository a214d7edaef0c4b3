//! Error types for kubelease
//!
//! Errors are structured with fields to aid diagnosis in production.
//! Remote failures carry the operation and the resource they targeted,
//! and issuance failures carry the step that failed together with the
//! outcome of rolling back whatever that issuance had already created.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Remote operation performed against the target cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Create-if-absent of a namespace
    EnsureNamespace,
    /// Creation of a service account identity
    CreateIdentity,
    /// Lookup of the token material bound to an identity
    FetchCredentials,
    /// Deletion of a service account identity
    DeleteIdentity,
    /// Creation of a role binding
    CreateBinding,
    /// Deletion of a role binding
    DeleteBinding,
}

impl Operation {
    /// Stable name used in logs and error messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::EnsureNamespace => "ensure_namespace",
            Operation::CreateIdentity => "create_identity",
            Operation::FetchCredentials => "fetch_credentials",
            Operation::DeleteIdentity => "delete_identity",
            Operation::CreateBinding => "create_binding",
            Operation::DeleteBinding => "delete_binding",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a remote resource managed by kubelease
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Namespace
    Namespace,
    /// ServiceAccount
    Identity,
    /// RoleBinding
    Binding,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Namespace => "namespace",
            ResourceKind::Identity => "identity",
            ResourceKind::Binding => "binding",
        })
    }
}

/// A remote resource identified by kind, namespace and name
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    /// Resource kind
    pub kind: ResourceKind,
    /// Namespace the resource lives in (equal to `name` for namespaces)
    pub namespace: String,
    /// Resource name
    pub name: String,
}

impl ResourceRef {
    /// Reference a namespace
    pub fn namespace(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: ResourceKind::Namespace,
            namespace: name.clone(),
            name,
        }
    }

    /// Reference an identity inside a namespace
    pub fn identity(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Identity,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Reference a binding inside a namespace
    pub fn binding(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Binding,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ResourceKind::Namespace => write!(f, "namespace {}", self.name),
            kind => write!(f, "{} {}/{}", kind, self.namespace, self.name),
        }
    }
}

/// Step of the issuance pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IssueStep {
    /// Ensuring the target namespace exists
    EnsureNamespace,
    /// Creating the identity
    CreateIdentity,
    /// Waiting for and reading the identity's credential
    FetchCredentials,
    /// Binding the role to the identity
    CreateBinding,
    /// Computing the effective lease TTL
    ComputeTtl,
    /// Building the lease descriptor
    AssembleLease,
}

impl fmt::Display for IssueStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IssueStep::EnsureNamespace => "ensure_namespace",
            IssueStep::CreateIdentity => "create_identity",
            IssueStep::FetchCredentials => "fetch_credentials",
            IssueStep::CreateBinding => "create_binding",
            IssueStep::ComputeTtl => "compute_ttl",
            IssueStep::AssembleLease => "assemble_lease",
        })
    }
}

/// What happened to the resources of a failed issuance
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompensationReport {
    /// Resources deleted during rollback
    pub rolled_back: Vec<ResourceRef>,
    /// Resources whose deletion failed, with the failure description
    pub failed: Vec<(ResourceRef, String)>,
    /// Resources intentionally left in place (auto-created namespaces)
    pub retained: Vec<ResourceRef>,
}

impl CompensationReport {
    /// True when every created resource that should be rolled back was
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Resources known to still exist in the target cluster
    pub fn remaining(&self) -> Vec<&ResourceRef> {
        self.failed
            .iter()
            .map(|(r, _)| r)
            .chain(self.retained.iter())
            .collect()
    }
}

impl fmt::Display for CompensationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rolled_back.is_empty() && self.failed.is_empty() && self.retained.is_empty() {
            return f.write_str("no resources were allocated");
        }
        if !self.rolled_back.is_empty() {
            let names: Vec<String> = self.rolled_back.iter().map(|r| r.to_string()).collect();
            write!(f, "rolled back [{}]", names.join(", "))?;
        }
        if !self.failed.is_empty() {
            let names: Vec<String> = self
                .failed
                .iter()
                .map(|(r, e)| format!("{} ({})", r, e))
                .collect();
            if !self.rolled_back.is_empty() {
                f.write_str("; ")?;
            }
            write!(
                f,
                "rollback failed, manual cleanup required for [{}]",
                names.join(", ")
            )?;
        }
        if !self.retained.is_empty() {
            let names: Vec<String> = self.retained.iter().map(|r| r.to_string()).collect();
            if !self.rolled_back.is_empty() || !self.failed.is_empty() {
                f.write_str("; ")?;
            }
            write!(f, "retained [{}]", names.join(", "))?;
        }
        Ok(())
    }
}

/// An issuance that failed after remote work may have started
#[derive(Debug)]
pub struct IssuanceFailure {
    /// Step that failed
    pub step: IssueStep,
    /// The original error, never replaced by a rollback failure
    pub cause: Error,
    /// Outcome of rolling back the resources created before `step`
    pub compensation: CompensationReport,
}

/// Main error type for kubelease operations
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid administrative configuration
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what's wrong
        message: String,
        /// The offending configuration field, if known
        field: Option<String>,
    },

    /// Requested tier has no configured role binding
    #[error("tier '{tier}' is not allowed, valid tiers: {}", .allowed.join(", "))]
    TierNotAllowed {
        /// The tier the caller asked for
        tier: String,
        /// Tiers that are configured, sorted
        allowed: Vec<String>,
    },

    /// A create/delete/read against the target cluster failed
    #[error("{operation} failed for {resource}: {message}")]
    RemoteResource {
        /// Operation that failed
        operation: Operation,
        /// Resource the operation targeted
        resource: String,
        /// Description from the remote system
        message: String,
        /// HTTP status reported by the remote API, if any
        status: Option<u16>,
    },

    /// Credential material never appeared for a freshly created identity
    #[error("credentials for identity {namespace}/{identity} did not materialize within {waited:?}")]
    PropagationTimeout {
        /// Namespace of the identity
        namespace: String,
        /// Name of the identity
        identity: String,
        /// How long the poll waited
        waited: Duration,
    },

    /// More than one credential references the identity
    #[error("found {count} credentials for identity {namespace}/{identity}, expected exactly one")]
    MultipleSecrets {
        /// Namespace of the identity
        namespace: String,
        /// Name of the identity
        identity: String,
        /// Number of credentials found
        count: usize,
    },

    /// TTL value that cannot be represented as a lease duration
    #[error("invalid ttl {value}: {message}")]
    InvalidTtl {
        /// The offending value in seconds
        value: i64,
        /// Why it was rejected
        message: String,
    },

    /// A lease descriptor presented for revocation is unusable
    #[error("invalid lease descriptor: {field} {message}")]
    InvalidLease {
        /// Descriptor field at fault
        field: String,
        /// Why it was rejected
        message: String,
    },

    /// The caller cancelled the request or a remote call timed out
    #[error("{} during {operation}", cancel_verb(.timed_out))]
    Cancelled {
        /// Operation in flight when the cancellation was observed
        operation: String,
        /// Whether a per-call timeout (rather than the caller) fired
        timed_out: bool,
    },

    /// Reading or writing the persisted configuration record failed
    #[error("storage error [{key}]: {message}")]
    Storage {
        /// Storage key being accessed
        key: String,
        /// Description of what failed
        message: String,
    },

    /// Issuance failed after tier resolution; carries rollback outcome
    #[error("issuance failed at {}: {}; {}", .0.step, .0.cause, .0.compensation)]
    Issuance(Box<IssuanceFailure>),
}

fn cancel_verb(timed_out: &bool) -> &'static str {
    if *timed_out {
        "timed out"
    } else {
        "cancelled"
    }
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the invalid field
    pub fn configuration_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Configuration error returned when no configuration was ever written
    pub fn not_configured() -> Self {
        Self::configuration("backend is not configured, write the config first")
    }

    /// Create a tier error listing the valid tiers
    pub fn tier_not_allowed(tier: impl Into<String>, mut allowed: Vec<String>) -> Self {
        allowed.sort();
        Self::TierNotAllowed {
            tier: tier.into(),
            allowed,
        }
    }

    /// Create a remote resource error without a status code
    pub fn remote(
        operation: Operation,
        resource: impl fmt::Display,
        msg: impl Into<String>,
    ) -> Self {
        Self::RemoteResource {
            operation,
            resource: resource.to_string(),
            message: msg.into(),
            status: None,
        }
    }

    /// Create a remote resource error with an HTTP status code
    pub fn remote_with_status(
        operation: Operation,
        resource: impl fmt::Display,
        status: u16,
        msg: impl Into<String>,
    ) -> Self {
        Self::RemoteResource {
            operation,
            resource: resource.to_string(),
            message: msg.into(),
            status: Some(status),
        }
    }

    /// Wrap a kube-rs error with operation context
    pub fn from_kube(operation: Operation, resource: impl fmt::Display, err: &kube::Error) -> Self {
        Self::RemoteResource {
            operation,
            resource: resource.to_string(),
            message: err.to_string(),
            status: crate::kube_utils::api_status(err),
        }
    }

    /// Create an invalid TTL error
    pub fn invalid_ttl(value: i64, msg: impl Into<String>) -> Self {
        Self::InvalidTtl {
            value,
            message: msg.into(),
        }
    }

    /// Create an invalid lease error for a descriptor field
    pub fn invalid_lease(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidLease {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Error for an operation abandoned because the caller cancelled
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            timed_out: false,
        }
    }

    /// Error for an operation abandoned because its time budget ran out
    pub fn timed_out(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            timed_out: true,
        }
    }

    /// Create a storage error for the given key
    pub fn storage(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Storage {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Wrap an error raised at `step` together with its rollback outcome
    pub fn issuance(step: IssueStep, cause: Error, compensation: CompensationReport) -> Self {
        Self::Issuance(Box::new(IssuanceFailure {
            step,
            cause,
            compensation,
        }))
    }

    /// The original error, unwrapping any issuance context
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Issuance(failure) => failure.cause.root_cause(),
            other => other,
        }
    }

    /// Rollback outcome if this error came from a failed issuance
    pub fn compensation(&self) -> Option<&CompensationReport> {
        match self {
            Error::Issuance(failure) => Some(&failure.compensation),
            _ => None,
        }
    }

    /// Issuance step that failed, if this error came from a failed issuance
    pub fn failed_step(&self) -> Option<IssueStep> {
        match self {
            Error::Issuance(failure) => Some(failure.step),
            _ => None,
        }
    }

    /// Whether the remote system reported the resource as absent
    ///
    /// Revocation callers whose goal is "ensure deleted" treat this as success.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root_cause(),
            Error::RemoteResource {
                status: Some(404),
                ..
            }
        )
    }

    /// Whether the failure was caused by the caller rather than the cluster
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self.root_cause(),
            Error::TierNotAllowed { .. } | Error::InvalidTtl { .. } | Error::InvalidLease { .. }
        )
    }

    /// Get the configuration or descriptor field if this error names one
    pub fn field(&self) -> Option<&str> {
        match self {
            Error::Configuration { field, .. } => field.as_deref(),
            Error::InvalidLease { field, .. } => Some(field),
            _ => None,
        }
    }
}
