//! Persistent storage for bridge credentials
//!
//! Uses JSON file storage in ~/.config/bridgelink/bridges.json

use crate::record::BridgeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Bridge not found: {0}")]
    NotFound(String),
    #[error("Configuration directory not found")]
    NoConfigDir,
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Key-value persistence of per-bridge address and token
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_ip(&self, id: &BridgeId) -> Option<String>;
    async fn set_ip(&self, id: &BridgeId, ip: &str) -> StorageResult<()>;
    async fn get_token(&self, id: &BridgeId) -> Option<String>;
    async fn set_token(&self, id: &BridgeId, token: &str) -> StorageResult<()>;
    /// Write address and token together; on error neither is stored
    async fn set_credentials(&self, id: &BridgeId, ip: &str, token: &str) -> StorageResult<()>;
    /// IDs of every bridge with stored credentials
    async fn bridge_ids(&self) -> Vec<BridgeId>;
    /// Drop everything stored for a bridge
    async fn forget(&self, id: &BridgeId) -> StorageResult<()>;
}

/// Credentials stored for one bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(default)]
    ip: String,
    #[serde(default)]
    token: String,
}

/// Stored data structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredData {
    /// Credentials indexed by bridge ID
    #[serde(default)]
    bridges: BTreeMap<String, StoredCredentials>,
}

impl StoredData {
    fn ids(&self) -> Vec<BridgeId> {
        self.bridges
            .keys()
            .filter_map(|key| match BridgeId::parse(key) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!("Skipping stored bridge with malformed id {}: {}", key, e);
                    None
                }
            })
            .collect()
    }
}

/// Credential store with file persistence
pub struct FileCredentialStore {
    /// Path to the storage file
    path: PathBuf,
    /// In-memory cache of credentials
    data: RwLock<StoredData>,
}

impl FileCredentialStore {
    /// Create a store at the default location
    ///
    /// Loads existing data from disk if present.
    pub async fn new() -> StorageResult<Self> {
        let path = Self::default_path()?;
        Self::with_path(path).await
    }

    /// Create storage at a specific path
    pub async fn with_path(path: PathBuf) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            match serde_json::from_str(&contents) {
                Ok(data) => {
                    info!("Loaded bridge storage from {:?}", path);
                    data
                }
                Err(e) => {
                    warn!("Failed to parse bridge storage, starting fresh: {}", e);
                    StoredData::default()
                }
            }
        } else {
            debug!("No existing bridge storage, creating new");
            StoredData::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Get the default storage path (~/.config/bridgelink/bridges.json)
    pub fn default_path() -> StorageResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(StorageError::NoConfigDir)?;
        Ok(config_dir.join("bridgelink").join("bridges.json"))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Write the snapshot next to the target, then rename over it
    fn save(&self, data: &StoredData) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(data)?;
        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;
        debug!("Saved bridge storage to {:?}", self.path);
        Ok(())
    }

    /// Apply `f` to a copy and only keep it once it is on disk
    async fn update<F>(&self, id: &BridgeId, f: F) -> StorageResult<()>
    where
        F: FnOnce(&mut StoredCredentials),
    {
        let mut data = self.data.write().await;
        let mut next = data.clone();
        f(next.bridges.entry(id.to_string()).or_default());
        self.save(&next)?;
        *data = next;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get_ip(&self, id: &BridgeId) -> Option<String> {
        let data = self.data.read().await;
        data.bridges.get(&id.to_string()).map(|c| c.ip.clone())
    }

    async fn set_ip(&self, id: &BridgeId, ip: &str) -> StorageResult<()> {
        self.update(id, |c| c.ip = ip.to_string()).await
    }

    async fn get_token(&self, id: &BridgeId) -> Option<String> {
        let data = self.data.read().await;
        data.bridges.get(&id.to_string()).map(|c| c.token.clone())
    }

    async fn set_token(&self, id: &BridgeId, token: &str) -> StorageResult<()> {
        self.update(id, |c| c.token = token.to_string()).await
    }

    async fn set_credentials(&self, id: &BridgeId, ip: &str, token: &str) -> StorageResult<()> {
        self.update(id, |c| {
            c.ip = ip.to_string();
            c.token = token.to_string();
        })
        .await
    }

    async fn bridge_ids(&self) -> Vec<BridgeId> {
        self.data.read().await.ids()
    }

    async fn forget(&self, id: &BridgeId) -> StorageResult<()> {
        let id_str = id.to_string();
        let mut data = self.data.write().await;
        let mut next = data.clone();
        if next.bridges.remove(&id_str).is_none() {
            return Err(StorageError::NotFound(id_str));
        }
        self.save(&next)?;
        *data = next;
        info!("Removed stored credentials for bridge {}", id_str);
        Ok(())
    }
}

/// Volatile credential store, for tests and `--ephemeral` runs
#[derive(Default)]
pub struct MemoryCredentialStore {
    data: RwLock<StoredData>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_ip(&self, id: &BridgeId) -> Option<String> {
        let data = self.data.read().await;
        data.bridges.get(&id.to_string()).map(|c| c.ip.clone())
    }

    async fn set_ip(&self, id: &BridgeId, ip: &str) -> StorageResult<()> {
        let mut data = self.data.write().await;
        data.bridges.entry(id.to_string()).or_default().ip = ip.to_string();
        Ok(())
    }

    async fn get_token(&self, id: &BridgeId) -> Option<String> {
        let data = self.data.read().await;
        data.bridges.get(&id.to_string()).map(|c| c.token.clone())
    }

    async fn set_token(&self, id: &BridgeId, token: &str) -> StorageResult<()> {
        let mut data = self.data.write().await;
        data.bridges.entry(id.to_string()).or_default().token = token.to_string();
        Ok(())
    }

    async fn set_credentials(&self, id: &BridgeId, ip: &str, token: &str) -> StorageResult<()> {
        let mut data = self.data.write().await;
        data.bridges.insert(
            id.to_string(),
            StoredCredentials {
                ip: ip.to_string(),
                token: token.to_string(),
            },
        );
        Ok(())
    }

    async fn bridge_ids(&self) -> Vec<BridgeId> {
        self.data.read().await.ids()
    }

    async fn forget(&self, id: &BridgeId) -> StorageResult<()> {
        let id_str = id.to_string();
        let mut data = self.data.write().await;
        data.bridges
            .remove(&id_str)
            .map(|_| ())
            .ok_or(StorageError::NotFound(id_str))
    }
}
