//! Issuance and revocation of short-lived Kubernetes credentials
//!
//! A lease is a ServiceAccount plus a RoleBinding in a target namespace,
//! together with the account's bearer token. [`Backend`] issues leases for
//! configured tiers, rolls back partially created resources when a step
//! fails, and tears leases down again in dependency order.

#![deny(missing_docs)]

pub mod backend;
pub mod client;
pub mod config;
pub mod context;
pub mod issue;
pub mod kube_client;
pub mod lease;
pub mod memory;
pub mod revoke;
pub mod storage;
pub mod store;
pub mod ttl;

pub use backend::Backend;
pub use client::{
    BindingInfo, ClusterClient, ClusterConnector, GeneratedResource,
    IdentityCredential, IdentityInfo, NamespaceStatus, StaticConnector,
};
pub use config::{BindingKind, ConfigRecord, Configuration, TierPolicy};
pub use context::RequestContext;
pub use issue::{IssuanceOrchestrator, IssueRequest};
pub use kube_client::{KubeClusterClient, KubeConnector};
pub use lease::{LeaseDescriptor, LeaseOptions, RevocationTarget};
pub use memory::{Call, InMemoryCluster};
pub use revoke::RevocationHandler;
pub use storage::{FileStorage, MemoryStorage, SecretStorage, Storage};
pub use store::ConfigStore;
