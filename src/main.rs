//! Gridnode agent daemon
//!
//! Probes local capability, connects to the broker, and serves dispatched
//! inference work until interrupted.

use anyhow::Context;
use gridnode::{
    AgentConfig, AgentSession, CapabilityProber, FileStore, WsConnector,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gridnode=info")),
        )
        .init();

    let config = AgentConfig::load().context("failed to load configuration")?;
    info!(broker = %config.broker_ws_url, "starting gridnode agent");

    let store = Arc::new(match &config.data_path {
        Some(path) => FileStore::new(path.clone()),
        None => FileStore::with_default_path(),
    });

    // Capability is probed fresh on every startup; hardware may have changed.
    let prober = CapabilityProber::new(config.local_endpoint.clone());
    let capability = prober.detect(store.as_ref()).await;

    let connector = Arc::new(
        WsConnector::new(&config.broker_ws_url).context("invalid broker WebSocket URL")?,
    );

    let session = AgentSession::new(&config, connector, store, capability).await;

    if let Err(e) = session.connect().await {
        // A transport failure keeps retrying in the background; a registration
        // rejection will not resolve itself, so bail out.
        if matches!(e, gridnode::AgentError::Registration(_)) {
            return Err(e).context("broker rejected registration");
        }
        error!("initial connection failed, retrying in background: {}", e);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!(earnings = session.earnings().await, "shutting down");
    session.disconnect().await;
    // Give the event loop a moment to close the socket cleanly.
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    Ok(())
}
