//! kubelease server
//!
//! Exposes the lease engine over HTTP so a secrets host can configure it,
//! issue short-lived cluster credentials and revoke them when leases expire.

#![deny(missing_docs)]

pub mod error;
pub mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::info;

use kubelease_engine::{
    Backend, ClusterConnector, FileStorage, InMemoryCluster, KubeConnector, MemoryStorage,
    SecretStorage, StaticConnector, Storage, TierPolicy,
};

pub use error::{Error, Result};
use routes::AppState;

/// Where the configuration record is persisted
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    /// Process memory, lost on restart
    Memory,
    /// JSON files under `--state-dir`
    File,
    /// A Secret in the cluster kubelease runs in
    Secret,
}

/// Which cluster leases are issued against
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ClusterKind {
    /// The cluster named by the stored configuration
    Kube,
    /// An in-process simulated cluster, for demos and local testing
    Memory,
}

/// kubelease - short-lived Kubernetes credentials for a secrets host
#[derive(Parser, Debug, Clone)]
#[command(name = "kubelease", version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "KUBELEASE_LISTEN", default_value = "0.0.0.0:8200")]
    pub listen: SocketAddr,

    /// Configuration storage backend
    #[arg(long, env = "KUBELEASE_STORAGE", value_enum, default_value = "file")]
    pub storage: StorageKind,

    /// Directory for `--storage file`
    #[arg(long, env = "KUBELEASE_STATE_DIR", default_value = "/var/lib/kubelease")]
    pub state_dir: PathBuf,

    /// Namespace of the Secret for `--storage secret`
    #[arg(long, env = "KUBELEASE_SECRET_NAMESPACE", default_value = "kubelease-system")]
    pub secret_namespace: String,

    /// Name of the Secret for `--storage secret`
    #[arg(long, env = "KUBELEASE_SECRET_NAME", default_value = "kubelease-config")]
    pub secret_name: String,

    /// Tier policy: `open` accepts any configured tier, `builtin` requires
    /// exactly admin, editor and viewer
    #[arg(long, env = "KUBELEASE_TIER_POLICY", default_value = "open")]
    pub tier_policy: TierPolicy,

    /// Target cluster implementation
    #[arg(long, env = "KUBELEASE_CLUSTER", value_enum, default_value = "kube")]
    pub cluster: ClusterKind,

    /// Upper bound on each remote call, seconds
    #[arg(long, env = "KUBELEASE_CALL_TIMEOUT", default_value_t = 30)]
    pub call_timeout_secs: u64,

    /// Emit JSON logs
    #[arg(long, env = "KUBELEASE_LOG_JSON")]
    pub log_json: bool,

    /// OTLP collector endpoint for trace export
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

impl Cli {
    /// Build the backend described by the flags
    pub async fn backend(&self) -> Result<Backend> {
        let storage = self.build_storage().await?;
        Ok(Backend::new(storage, self.tier_policy, self.build_connector()))
    }

    async fn build_storage(&self) -> Result<Arc<dyn Storage>> {
        Ok(match self.storage {
            StorageKind::Memory => Arc::new(MemoryStorage::new()),
            StorageKind::File => Arc::new(FileStorage::new(&self.state_dir)),
            StorageKind::Secret => {
                let client = kube::Client::try_default().await?;
                Arc::new(SecretStorage::new(
                    client,
                    &self.secret_namespace,
                    &self.secret_name,
                ))
            }
        })
    }

    fn build_connector(&self) -> Arc<dyn ClusterConnector> {
        match self.cluster {
            ClusterKind::Kube => Arc::new(KubeConnector::default()),
            ClusterKind::Memory => Arc::new(StaticConnector::new(Arc::new(InMemoryCluster::new()))),
        }
    }

    /// Serve until interrupted
    pub async fn run(self) -> Result<()> {
        let backend = self.backend().await?;
        let state = AppState {
            backend,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        };
        let app = routes::router(state);

        let listener = tokio::net::TcpListener::bind(self.listen)
            .await
            .map_err(|source| Error::Bind {
                addr: self.listen,
                source,
            })?;
        info!(
            addr = %self.listen,
            storage = ?self.storage,
            cluster = ?self.cluster,
            tier_policy = %self.tier_policy,
            "kubelease listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(Error::Serve)?;
        info!("kubelease stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
