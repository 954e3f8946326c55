//! Agent error types

use thiserror::Error;

/// Agent error type
#[derive(Error, Debug)]
pub enum AgentError {
    /// Broker rejected the registration payload
    #[error("Registration error: {0}")]
    Registration(String),

    /// Socket-level open/send/close failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Local inference provider failed or timed out
    #[error("Provider error: {0}")]
    Provider(String),

    /// Inbound frame failed to parse or had an unknown type
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Credential store read/write failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid broker URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// connect() called while already connecting or connected
    #[error("Already connecting or connected")]
    AlreadyActive,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Agent result type
pub type Result<T> = std::result::Result<T, AgentError>;
