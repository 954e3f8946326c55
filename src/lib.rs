//! Gridnode - Offer spare local compute to an inference broker
//!
//! This crate implements the agent side of a compute-sharing scheme:
//! - Probe the machine for a GPU and a local inference server
//! - Register with the broker once and persist the issued identity
//! - Hold a WebSocket connection to the broker, reconnecting with backoff
//! - Answer dispatched inference requests, falling back to a synthetic
//!   response when no local model is reachable
//! - Track earnings from answered work at the configured per-token rate

pub mod backoff;
pub mod capability;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod machine;
pub mod pricing;
pub mod protocol;
pub mod registration;
pub mod session;
pub mod store;
pub mod transport;

pub use capability::{Capability, CapabilityProber};
pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use machine::ConnectionState;
pub use pricing::PriceSheet;
pub use session::{AgentSession, AgentStatus, SettingsUpdate};
pub use store::{CredentialStore, FileStore, MemoryStore, PluginIdentity};
pub use transport::{Connector, WsConnector};
