//! Durable key/value persistence for agent identity and settings
//!
//! The store holds an opaque JSON blob with no schema versioning; every field
//! is optional so older files (or a missing file) read as "not yet
//! registered".

use crate::capability::Capability;
use crate::error::{AgentError, Result};
use crate::pricing::PriceSheet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;

/// Durable identity with the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginIdentity {
    pub plugin_id: String,
    pub connection_token: String,
}

/// On-disk blob; all keys optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredState {
    #[serde(default)]
    plugin_id: Option<String>,
    #[serde(default)]
    connection_token: Option<String>,
    #[serde(default)]
    capability: Option<Capability>,
    #[serde(default)]
    pricing: Option<PriceSheet>,
    #[serde(default)]
    earnings: Option<f64>,
}

/// Key/value persistence contract for plugin identity and settings
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn identity(&self) -> Result<Option<PluginIdentity>>;
    async fn set_identity(&self, identity: &PluginIdentity) -> Result<()>;

    async fn capability(&self) -> Result<Option<Capability>>;
    async fn set_capability(&self, capability: &Capability) -> Result<()>;

    async fn pricing(&self) -> Result<Option<PriceSheet>>;
    async fn set_pricing(&self, pricing: &PriceSheet) -> Result<()>;

    async fn earnings(&self) -> Result<f64>;
    async fn set_earnings(&self, earnings: f64) -> Result<()>;
}

/// File-backed store at a JSON path
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl FileStore {
    /// Create a store at the given path
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Default storage path for the agent
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gridnode")
            .join("credentials.json")
    }

    /// Create a store at the default location
    pub fn with_default_path() -> Self {
        Self::new(Self::default_path())
    }

    async fn read(&self) -> Result<StoredState> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| AgentError::Storage(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoredState::default()),
            Err(e) => Err(AgentError::Storage(e.to_string())),
        }
    }

    async fn write(&self, state: &StoredState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::Storage(e.to_string()))?;
        }
        let content =
            serde_json::to_string_pretty(state).map_err(|e| AgentError::Storage(e.to_string()))?;
        fs::write(&self.path, content)
            .await
            .map_err(|e| AgentError::Storage(e.to_string()))
    }

    async fn update<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut StoredState),
    {
        let _guard = self.lock.lock().await;
        let mut state = self.read().await?;
        apply(&mut state);
        self.write(&state).await
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn identity(&self) -> Result<Option<PluginIdentity>> {
        let state = self.read().await?;
        match (state.plugin_id, state.connection_token) {
            (Some(plugin_id), Some(connection_token)) => Ok(Some(PluginIdentity {
                plugin_id,
                connection_token,
            })),
            _ => Ok(None),
        }
    }

    async fn set_identity(&self, identity: &PluginIdentity) -> Result<()> {
        let identity = identity.clone();
        self.update(move |state| {
            state.plugin_id = Some(identity.plugin_id);
            state.connection_token = Some(identity.connection_token);
        })
        .await
    }

    async fn capability(&self) -> Result<Option<Capability>> {
        Ok(self.read().await?.capability)
    }

    async fn set_capability(&self, capability: &Capability) -> Result<()> {
        let capability = capability.clone();
        self.update(move |state| state.capability = Some(capability))
            .await
    }

    async fn pricing(&self) -> Result<Option<PriceSheet>> {
        Ok(self.read().await?.pricing)
    }

    async fn set_pricing(&self, pricing: &PriceSheet) -> Result<()> {
        let pricing = pricing.clone();
        self.update(move |state| state.pricing = Some(pricing))
            .await
    }

    async fn earnings(&self) -> Result<f64> {
        Ok(self.read().await?.earnings.unwrap_or(0.0))
    }

    async fn set_earnings(&self, earnings: f64) -> Result<()> {
        self.update(move |state| state.earnings = Some(earnings))
            .await
    }
}

/// In-memory store for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoredState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn identity(&self) -> Result<Option<PluginIdentity>> {
        let state = self.state.lock().await;
        match (&state.plugin_id, &state.connection_token) {
            (Some(plugin_id), Some(connection_token)) => Ok(Some(PluginIdentity {
                plugin_id: plugin_id.clone(),
                connection_token: connection_token.clone(),
            })),
            _ => Ok(None),
        }
    }

    async fn set_identity(&self, identity: &PluginIdentity) -> Result<()> {
        let mut state = self.state.lock().await;
        state.plugin_id = Some(identity.plugin_id.clone());
        state.connection_token = Some(identity.connection_token.clone());
        Ok(())
    }

    async fn capability(&self) -> Result<Option<Capability>> {
        Ok(self.state.lock().await.capability.clone())
    }

    async fn set_capability(&self, capability: &Capability) -> Result<()> {
        self.state.lock().await.capability = Some(capability.clone());
        Ok(())
    }

    async fn pricing(&self) -> Result<Option<PriceSheet>> {
        Ok(self.state.lock().await.pricing.clone())
    }

    async fn set_pricing(&self, pricing: &PriceSheet) -> Result<()> {
        self.state.lock().await.pricing = Some(pricing.clone());
        Ok(())
    }

    async fn earnings(&self) -> Result<f64> {
        Ok(self.state.lock().await.earnings.unwrap_or(0.0))
    }

    async fn set_earnings(&self, earnings: f64) -> Result<()> {
        self.state.lock().await.earnings = Some(earnings);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("credentials.json"));
        (dir, store)
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_unregistered() {
        let (_dir, store) = temp_store();
        assert!(store.identity().await.unwrap().is_none());
        assert!(store.capability().await.unwrap().is_none());
        assert_eq!(store.earnings().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_identity_round_trip() {
        let (_dir, store) = temp_store();
        let identity = PluginIdentity {
            plugin_id: "p1".to_string(),
            connection_token: "t1".to_string(),
        };
        store.set_identity(&identity).await.unwrap();
        assert_eq!(store.identity().await.unwrap(), Some(identity));
    }

    #[tokio::test]
    async fn test_partial_blob_tolerated() {
        let (_dir, store) = temp_store();
        // plugin_id without connection_token must read as unregistered
        tokio::fs::create_dir_all(store.path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&store.path, r#"{"plugin_id":"p1"}"#)
            .await
            .unwrap();
        assert!(store.identity().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_settings_survive_identity_update() {
        let (_dir, store) = temp_store();
        store.set_pricing(&PriceSheet::new(0.5)).await.unwrap();
        store
            .set_identity(&PluginIdentity {
                plugin_id: "p".to_string(),
                connection_token: "t".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(store.pricing().await.unwrap(), Some(PriceSheet::new(0.5)));
    }
}
