//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Broker WebSocket URL
    pub broker_ws_url: String,
    /// Broker HTTP base URL for registration
    pub broker_http_url: String,
    /// Local inference server to probe (Ollama-compatible)
    pub local_endpoint: String,
    /// Per-token price offered to the broker
    #[serde(default = "default_base_rate")]
    pub base_rate: f64,
    /// Handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Initial reconnection delay in seconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Maximum reconnection delay in seconds
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_secs: u64,
    /// Reconnection attempts (0 = infinite)
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    /// Drop the connection after this long without any inbound frame
    /// (0 = disabled)
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Storage path override
    #[serde(default)]
    pub data_path: Option<PathBuf>,
}

fn default_base_rate() -> f64 {
    crate::pricing::DEFAULT_BASE_RATE
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_reconnect_delay() -> u64 {
    1
}

fn default_max_reconnect_delay() -> u64 {
    60
}

fn default_heartbeat_timeout() -> u64 {
    120
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker_ws_url: "wss://broker.gridnode.dev/plugin/connect".to_string(),
            broker_http_url: "https://broker.gridnode.dev".to_string(),
            local_endpoint: crate::capability::DEFAULT_LOCAL_ENDPOINT.to_string(),
            base_rate: default_base_rate(),
            connect_timeout_secs: default_connect_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
            max_reconnect_delay_secs: default_max_reconnect_delay(),
            max_reconnect_attempts: 0, // Infinite
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            data_path: None,
        }
    }
}

impl AgentConfig {
    /// Load config from file or create default
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: AgentConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to file
    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Get config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("gridnode").join("config.toml"))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_secs)
    }

    /// Dead-man timer for the broker link; `None` when disabled
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        match self.heartbeat_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Set broker URLs
    pub fn with_broker(mut self, ws_url: impl Into<String>, http_url: impl Into<String>) -> Self {
        self.broker_ws_url = ws_url.into();
        self.broker_http_url = http_url.into();
        self
    }

    /// Set per-token price
    pub fn with_base_rate(mut self, base_rate: f64) -> Self {
        self.base_rate = base_rate;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.base_rate, crate::pricing::DEFAULT_BASE_RATE);
        assert_eq!(config.max_reconnect_attempts, 0);
    }

    #[test]
    fn test_config_serialization() {
        let config = AgentConfig::default().with_base_rate(0.001);
        let toml_str = toml::to_string(&config).expect("should serialize");
        let parsed: AgentConfig = toml::from_str(&toml_str).expect("should deserialize");
        assert_eq!(parsed.base_rate, 0.001);
        assert_eq!(config.broker_ws_url, parsed.broker_ws_url);
    }

    #[test]
    fn test_missing_keys_use_defaults() {
        let parsed: AgentConfig = toml::from_str(
            r#"
            broker_ws_url = "wss://example.com/connect"
            broker_http_url = "https://example.com"
            local_endpoint = "http://localhost:11434"
            "#,
        )
        .expect("should deserialize");
        assert_eq!(parsed.connect_timeout_secs, 10);
        assert_eq!(parsed.max_reconnect_delay_secs, 60);
        assert_eq!(parsed.heartbeat_timeout_secs, 120);
    }
}
