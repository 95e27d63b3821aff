//! The durable set of paired bridges
//!
//! Records live in memory behind a single lock and are written through to a
//! [`CredentialStore`]. Consumers get cloned snapshots; only pairing and the
//! health checker mutate records.

use crate::record::{BridgeId, BridgeRecord};
use crate::store::{CredentialStore, StorageError, StorageResult};
use bridgelink_core::{is_valid_ip, TestStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Bridge not found: {0}")]
    NotFound(BridgeId),
    #[error("Invalid bridge address: {0}")]
    InvalidAddress(String),
    #[error("Bridge {0} is already registered")]
    AlreadyRegistered(BridgeId),
    #[error("Cannot register bridge {0} without address and token")]
    Incomplete(BridgeId),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Health observations for one bridge, applied in a single write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthUpdate {
    /// Address the observations were made against
    pub ip: String,
    pub active: bool,
    pub token_status: TestStatus,
}

pub struct BridgeRegistry {
    store: Arc<dyn CredentialStore>,
    records: RwLock<HashMap<BridgeId, BridgeRecord>>,
}

impl BridgeRegistry {
    /// Build the registry from everything in `store`
    ///
    /// Runtime flags start cleared; the next health check fills them in.
    pub async fn load(store: Arc<dyn CredentialStore>) -> Self {
        let mut records = HashMap::new();
        for id in store.bridge_ids().await {
            let mut record = BridgeRecord::with_id(id.clone());
            record.set_ip(store.get_ip(&id).await.unwrap_or_default());
            record.token = store.get_token(&id).await.unwrap_or_default();
            records.insert(id, record);
        }
        info!("Loaded {} paired bridge(s)", records.len());

        Self {
            store,
            records: RwLock::new(records),
        }
    }

    /// All records, in no particular order
    pub async fn snapshot(&self) -> Vec<BridgeRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn ids(&self) -> Vec<BridgeId> {
        self.records.read().await.keys().cloned().collect()
    }

    pub async fn get(&self, id: &BridgeId) -> Option<BridgeRecord> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Add a freshly paired bridge
    pub async fn promote(&self, record: BridgeRecord) -> RegistryResult<()> {
        if !record.has_ip() || !record.has_token() {
            return Err(RegistryError::Incomplete(record.id().clone()));
        }

        let mut records = self.records.write().await;
        if records.contains_key(record.id()) {
            return Err(RegistryError::AlreadyRegistered(record.id().clone()));
        }

        self.store
            .set_credentials(record.id(), &record.ip, &record.token)
            .await?;

        info!("Registered bridge {} at {}", record.id(), record.ip);
        records.insert(record.id().clone(), record);
        Ok(())
    }

    /// Point a bridge at a new address
    ///
    /// The bridge is marked inactive until the next health check.
    pub async fn change_ip(&self, id: &BridgeId, ip: &str) -> RegistryResult<()> {
        if !is_valid_ip(ip) {
            return Err(RegistryError::InvalidAddress(ip.to_string()));
        }

        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        self.store.set_ip(id, ip).await?;
        record.set_ip(ip);
        record.reset_health();
        info!("Bridge {} moved to {}", id, ip);
        Ok(())
    }

    pub async fn remove(&self, id: &BridgeId) -> RegistryResult<BridgeRecord> {
        let mut records = self.records.write().await;
        let record = records
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        match self.store.forget(id).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => {
                records.insert(id.clone(), record);
                return Err(e.into());
            }
        }

        info!("Removed bridge {}", id);
        Ok(record)
    }

    /// Record the outcome of a health check on one bridge
    ///
    /// Returns the updated record, or `None` if the bridge was removed or
    /// moved to another address while it was being checked.
    pub async fn set_health(&self, id: &BridgeId, update: HealthUpdate) -> Option<BridgeRecord> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id)?;
        if record.ip != update.ip {
            debug!(
                "Dropping stale health result for bridge {} ({} is now {})",
                id, update.ip, record.ip
            );
            return None;
        }
        record.active = update.active;
        if !update.active {
            // an unreachable bridge cannot hold an event subscription
            record.connected = false;
        }
        record.token_status = update.token_status;
        record.last_checked = Some(Utc::now());
        debug!(
            "Bridge {} health: active={} token={}",
            id, update.active, update.token_status
        );
        Some(record.clone())
    }
}
