//! Key/value persistence for the configuration record
//!
//! The engine persists exactly one record under a fixed key, but backends
//! are keyed so a host can point several engines at one store.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Client;
use parking_lot::RwLock;
use tracing::debug;

use kubelease_common::{Error, Result, FIELD_MANAGER, LABEL_MANAGED_BY, LABEL_MANAGED_BY_KUBELEASE};

/// Byte-oriented key/value store
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the value stored under `key`, if any
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the value stored under `key`
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
}

fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !key.starts_with('.');
    if !valid {
        return Err(Error::storage(key, "invalid storage key"));
    }
    Ok(())
}

/// Process-local storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }
}

/// One JSON file per key inside a directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Store entries under `dir`, created on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage(
                key,
                format!("failed to read {}: {}", path.display(), e),
            )),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            Error::storage(key, format!("failed to create {}: {}", self.dir.display(), e))
        })?;

        // Readers see the old record or the new one, never a partial write
        let tmp = self.dir.join(format!(".{}.json.tmp", key));
        tokio::fs::write(&tmp, &value)
            .await
            .map_err(|e| Error::storage(key, format!("failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            Error::storage(key, format!("failed to replace {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Persisted storage entry");
        Ok(())
    }
}

/// Entries kept as data keys of a Kubernetes Secret in the local cluster
#[derive(Clone)]
pub struct SecretStorage {
    client: Client,
    namespace: String,
    name: String,
}

impl SecretStorage {
    /// Store entries in Secret `namespace/name`
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn api(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl Storage for SecretStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let secret = self.api().get_opt(&self.name).await.map_err(|e| {
            Error::storage(
                key,
                format!("failed to read secret {}/{}: {}", self.namespace, self.name, e),
            )
        })?;
        Ok(secret
            .and_then(|s| s.data)
            .and_then(|mut data| data.remove(key))
            .map(|v| v.0))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    LABEL_MANAGED_BY.to_string(),
                    LABEL_MANAGED_BY_KUBELEASE.to_string(),
                )])),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(BTreeMap::from([(key.to_string(), ByteString(value))])),
            ..Default::default()
        };

        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api()
            .patch(&self.name, &params, &Patch::Apply(&secret))
            .await
            .map_err(|e| {
                Error::storage(
                    key,
                    format!("failed to apply secret {}/{}: {}", self.namespace, self.name, e),
                )
            })?;
        debug!(namespace = %self.namespace, secret = %self.name, key, "Persisted storage entry");
        Ok(())
    }
}
