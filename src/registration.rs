//! One-shot registration exchange with the broker
//!
//! Obtains a `PluginIdentity` for this agent. Failures are not retried here;
//! they surface to whatever triggered `connect()`.

use crate::capability::Capability;
use crate::error::{AgentError, Result};
use crate::pricing::PriceSheet;
use crate::store::PluginIdentity;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    gpu_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    local_endpoint: Option<String>,
    pricing: f64,
    capabilities: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    success: bool,
    #[serde(default)]
    plugin_id: Option<String>,
    #[serde(default)]
    connection_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the broker's registration endpoint
pub struct RegistrationClient {
    base_url: String,
    http: reqwest::Client,
}

impl RegistrationClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Register this agent, supplying capability descriptors and a pricing hint
    pub async fn register(
        &self,
        capability: &Capability,
        pricing: &PriceSheet,
    ) -> Result<PluginIdentity> {
        let request = RegisterRequest {
            gpu_info: capability.gpu.clone(),
            local_endpoint: capability.local_endpoint.clone(),
            pricing: pricing.base_rate,
            capabilities: capability.labels(),
        };

        let url = format!("{}/plugin/register", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(REGISTER_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(|e| AgentError::Registration(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AgentError::Registration(format!(
                "broker returned {}",
                response.status()
            )));
        }

        let body: RegisterResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Registration(e.to_string()))?;

        if !body.success {
            return Err(AgentError::Registration(
                body.error.unwrap_or_else(|| "registration rejected".to_string()),
            ));
        }

        match (body.plugin_id, body.connection_token) {
            (Some(plugin_id), Some(connection_token)) => {
                info!(plugin_id = %plugin_id, "registered with broker");
                Ok(PluginIdentity {
                    plugin_id,
                    connection_token,
                })
            }
            _ => Err(AgentError::Registration(
                "broker response missing pluginId or connectionToken".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_request_shape() {
        let request = RegisterRequest {
            gpu_info: Some("RTX 4090".to_string()),
            local_endpoint: None,
            pricing: 0.0001,
            capabilities: vec!["inference".to_string(), "gpu".to_string()],
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["gpuInfo"], "RTX 4090");
        assert!(value.get("localEndpoint").is_none());
        assert_eq!(value["pricing"], 0.0001);
    }

    #[test]
    fn test_register_response_tolerates_missing_fields() {
        let body: RegisterResponse =
            serde_json::from_str(r#"{"success":false,"error":"bad capability"}"#).unwrap();
        assert!(!body.success);
        assert_eq!(body.error.as_deref(), Some("bad capability"));
        assert!(body.plugin_id.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_registration_error() {
        let client = RegistrationClient::new("http://127.0.0.1:1");
        let result = client
            .register(&Capability::default(), &PriceSheet::default())
            .await;
        assert!(matches!(result, Err(AgentError::Registration(_))));
    }
}
