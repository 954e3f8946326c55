//! Local capability probing
//!
//! Discovers what this machine can offer the broker: a GPU descriptor and a
//! locally reachable inference server. Both probes are best-effort; an absent
//! GPU or unreachable server yields an empty field, never an error.

use crate::store::CredentialStore;
use serde::{Deserialize, Serialize};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info};

/// Default local inference server to probe (Ollama's OpenAI-compatible base)
pub const DEFAULT_LOCAL_ENDPOINT: &str = "http://localhost:11434/v1";

/// Probe timeout for the model-listing request
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// What this agent can serve
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Hardware descriptor, e.g. "NVIDIA GeForce RTX 4090"
    pub gpu: Option<String>,
    /// Base URL of a reachable local inference server
    pub local_endpoint: Option<String>,
}

impl Capability {
    /// Capability labels advertised to the broker at registration
    pub fn labels(&self) -> Vec<String> {
        let mut labels = vec!["inference".to_string()];
        if self.gpu.is_some() {
            labels.push("gpu".to_string());
        }
        if self.local_endpoint.is_some() {
            labels.push("local_model".to_string());
        }
        labels
    }
}

/// Probes the local environment for compute capability
pub struct CapabilityProber {
    endpoint: String,
    http: reqwest::Client,
}

impl CapabilityProber {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Run both probes and persist the result
    pub async fn detect(&self, store: &dyn CredentialStore) -> Capability {
        let gpu = probe_gpu();
        let local_endpoint = self.probe_local_server().await;

        let capability = Capability {
            gpu,
            local_endpoint,
        };
        info!(
            gpu = capability.gpu.as_deref().unwrap_or("none"),
            endpoint = capability.local_endpoint.as_deref().unwrap_or("none"),
            "capability probe complete"
        );

        if let Err(e) = store.set_capability(&capability).await {
            debug!("failed to cache capability: {}", e);
        }

        capability
    }

    /// Return the cached capability if present, otherwise probe fresh
    pub async fn cached_or_detect(&self, store: &dyn CredentialStore) -> Capability {
        match store.capability().await {
            Ok(Some(cached)) => {
                debug!("using cached capability");
                cached
            }
            _ => self.detect(store).await,
        }
    }

    /// Check whether a local inference server answers a model-listing request
    async fn probe_local_server(&self) -> Option<String> {
        let url = format!("{}/models", self.endpoint);
        match self.http.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) if response.status().is_success() => Some(self.endpoint.clone()),
            Ok(response) => {
                debug!("local server probe returned {}", response.status());
                None
            }
            Err(e) => {
                debug!("local server not reachable: {}", e);
                None
            }
        }
    }
}

impl Default for CapabilityProber {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_ENDPOINT)
    }
}

/// Best-effort GPU descriptor via nvidia-smi
fn probe_gpu() -> Option<String> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let name = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()?
        .trim()
        .to_string();

    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_labels_reflect_capability() {
        let bare = Capability::default();
        assert_eq!(bare.labels(), vec!["inference"]);

        let full = Capability {
            gpu: Some("RTX 4090".to_string()),
            local_endpoint: Some("http://localhost:11434".to_string()),
        };
        assert_eq!(full.labels(), vec!["inference", "gpu", "local_model"]);
    }

    #[tokio::test]
    async fn test_detect_with_no_local_server() {
        // Port 1 is never an inference server; probe must swallow the failure.
        let prober = CapabilityProber::new("http://127.0.0.1:1");
        let store = MemoryStore::new();
        let capability = prober.detect(&store).await;
        assert_eq!(capability.local_endpoint, None);
    }

    #[tokio::test]
    async fn test_cached_capability_skips_probe() {
        let store = MemoryStore::new();
        let cached = Capability {
            gpu: Some("cached-gpu".to_string()),
            local_endpoint: None,
        };
        store.set_capability(&cached).await.unwrap();

        let prober = CapabilityProber::new("http://127.0.0.1:1");
        let capability = prober.cached_or_detect(&store).await;
        assert_eq!(capability.gpu.as_deref(), Some("cached-gpu"));
    }
}
