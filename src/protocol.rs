//! Wire frames exchanged with the broker
//!
//! Every message on the socket is a JSON object with a `type` discriminator.
//! Outbound: `connect`, `inference_response`, `heartbeat`.
//! Inbound: `connected`, `inference_request`, `heartbeat`.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};

/// One discrete message on the broker connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Registration frame sent after the socket opens
    #[serde(rename_all = "camelCase")]
    Connect {
        plugin_id: String,
        connection_token: String,
    },
    /// Broker acknowledgement completing the handshake
    Connected,
    /// One inference job from the broker
    #[serde(rename_all = "camelCase")]
    InferenceRequest {
        request_id: String,
        prompt: String,
        model: String,
    },
    /// Result for a previously received request, correlated by id
    #[serde(rename_all = "camelCase")]
    InferenceResponse {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<InferenceResult>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Liveness probe, echoed on receipt
    Heartbeat,
}

/// Successful inference payload inside an `inference_response`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub response: String,
    pub model: String,
    pub tokens: u64,
    pub cost: f64,
}

/// Parse an inbound text frame
///
/// Unknown `type` values and malformed JSON surface as `Protocol` errors so
/// the caller can log and drop the frame without tearing down the connection.
pub fn parse_frame(text: &str) -> Result<Frame> {
    serde_json::from_str(text).map_err(|e| AgentError::Protocol(e.to_string()))
}

/// Serialize an outbound frame
pub fn encode_frame(frame: &Frame) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}
