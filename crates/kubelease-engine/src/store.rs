//! Configuration store
//!
//! Validates and persists the single configuration record. Every write
//! fully replaces the record; a write that fails validation persists
//! nothing. Reads are never cached so an administrative update is seen by
//! the very next issuance or revocation.

use std::sync::Arc;

use tracing::info;

use kubelease_common::{Error, Result, CONFIG_STORAGE_KEY};

use crate::config::{ConfigRecord, Configuration, TierPolicy};
use crate::storage::Storage;

/// Validating store for the configuration record
#[derive(Clone)]
pub struct ConfigStore {
    storage: Arc<dyn Storage>,
    policy: TierPolicy,
}

impl ConfigStore {
    /// Create a store over `storage` enforcing `policy` on writes and reads
    pub fn new(storage: Arc<dyn Storage>, policy: TierPolicy) -> Self {
        Self { storage, policy }
    }

    /// Validate and persist a record, replacing any previous one
    pub async fn write(&self, record: &ConfigRecord) -> Result<Configuration> {
        let config = record.validate(self.policy)?;
        let bytes = serde_json::to_vec(record).map_err(|e| {
            Error::storage(
                CONFIG_STORAGE_KEY,
                format!("failed to serialize configuration: {}", e),
            )
        })?;
        self.storage.put(CONFIG_STORAGE_KEY, bytes).await?;

        info!(
            cluster = %config.server(),
            max_ttl_secs = record.max_ttl,
            default_ttl_secs = record.default_ttl,
            tiers = ?config.allowed_tiers(),
            "Configuration written"
        );
        Ok(config)
    }

    /// The persisted record as written, if any
    pub async fn read_record(&self) -> Result<Option<ConfigRecord>> {
        let Some(bytes) = self.storage.get(CONFIG_STORAGE_KEY).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            Error::storage(
                CONFIG_STORAGE_KEY,
                format!("stored configuration is corrupt: {}", e),
            )
        })
    }

    /// The validated configuration, if any was written
    ///
    /// A stored record that no longer satisfies the store's policy (for
    /// example after switching to the builtin policy) is a configuration
    /// error rather than "absent".
    pub async fn read(&self) -> Result<Option<Configuration>> {
        match self.read_record().await? {
            Some(record) => record.validate(self.policy).map(Some),
            None => Ok(None),
        }
    }

    /// The validated configuration, or a configuration error if none exists
    pub async fn load(&self) -> Result<Configuration> {
        self.read().await?.ok_or_else(Error::not_configured)
    }
}
