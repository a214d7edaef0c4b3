//! Common types for kubelease: errors, telemetry and Kubernetes helpers

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod kubeconfig;
pub mod poll;
pub mod telemetry;

pub use error::{
    CompensationReport, Error, IssuanceFailure, IssueStep, Operation, ResourceKind, ResourceRef,
};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "kubelease";

/// Standard Kubernetes label for the managing tool
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on resources created by kubelease
pub const LABEL_MANAGED_BY_KUBELEASE: &str = "kubelease";

/// Generate-name prefix for issued service accounts
pub const IDENTITY_NAME_PREFIX: &str = "kubelease-sa-";

/// Generate-name prefix for issued role bindings
pub const BINDING_NAME_PREFIX: &str = "kubelease-rb-";

/// Storage key of the configuration record
pub const CONFIG_STORAGE_KEY: &str = "config";
