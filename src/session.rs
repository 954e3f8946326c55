//! Agent session: owns the broker link
//!
//! One `AgentSession` is instantiated per process. It drives the connection
//! state machine, performs registration when no identity is stored, runs the
//! per-connection event loop, and exposes the status surface consumed by the
//! UI collaborator.
//!
//! Concurrency: the event loop is the only task that touches the transport.
//! Work items are handled in supervised tasks that feed response frames back
//! through an outbound channel; once the loop (and with it the receiver) is
//! gone, late results are discarded rather than retried.

use crate::backoff::ExponentialBackoff;
use crate::capability::Capability;
use crate::config::AgentConfig;
use crate::dispatch::{Dispatcher, WorkItem, WorkResult};
use crate::error::{AgentError, Result};
use crate::machine::{self, ConnectionState, Effect, Event};
use crate::pricing::PriceSheet;
use crate::protocol::{Frame, InferenceResult};
use crate::registration::RegistrationClient;
use crate::store::{CredentialStore, PluginIdentity};
use crate::transport::{Connector, Transport};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Poll interval for the connection event loop
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Read-only snapshot for the UI collaborator
#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub connected: bool,
    pub state: ConnectionState,
    pub capability: Capability,
}

/// Partial settings update; `None` fields are left unchanged
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub base_rate: Option<f64>,
    pub local_endpoint: Option<Option<String>>,
    pub gpu: Option<Option<String>>,
}

/// The agent's single logical connection to the broker
#[derive(Clone)]
pub struct AgentSession {
    connector: Arc<dyn Connector>,
    registration: Arc<RegistrationClient>,
    store: Arc<dyn CredentialStore>,
    state: Arc<RwLock<ConnectionState>>,
    capability: Arc<RwLock<Capability>>,
    pricing: Arc<RwLock<PriceSheet>>,
    earnings: Arc<RwLock<f64>>,
    /// Cleared by an explicit disconnect; set again by connect()
    retry_enabled: Arc<AtomicBool>,
    /// Socket generation; a stale event loop exits when it no longer matches
    generation: Arc<AtomicU64>,
    connect_timeout: Duration,
    heartbeat_timeout: Option<Duration>,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
    max_reconnect_attempts: u32,
}

impl AgentSession {
    /// Build a session. Pricing and earnings are seeded from the store when
    /// present so settings and totals survive restarts.
    pub async fn new(
        config: &AgentConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn CredentialStore>,
        capability: Capability,
    ) -> Self {
        let pricing = match store.pricing().await {
            Ok(Some(pricing)) => pricing,
            _ => PriceSheet::new(config.base_rate),
        };
        let earnings = store.earnings().await.unwrap_or(0.0);

        Self {
            connector,
            registration: Arc::new(RegistrationClient::new(config.broker_http_url.clone())),
            store,
            state: Arc::new(RwLock::new(ConnectionState::Idle)),
            capability: Arc::new(RwLock::new(capability)),
            pricing: Arc::new(RwLock::new(pricing)),
            earnings: Arc::new(RwLock::new(earnings)),
            retry_enabled: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            connect_timeout: config.connect_timeout(),
            heartbeat_timeout: config.heartbeat_timeout(),
            reconnect_delay: config.reconnect_delay(),
            max_reconnect_delay: config.max_reconnect_delay(),
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }

    /// Open the broker connection
    ///
    /// Registers first if no identity is stored; a registration failure
    /// surfaces here and leaves the session idle. A transport failure
    /// schedules background reconnection.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            let t = machine::step(*state, Event::ConnectRequested);
            if t.effect == Effect::RejectAlreadyActive {
                return Err(AgentError::AlreadyActive);
            }
            *state = t.next;
        }
        self.retry_enabled.store(true, Ordering::SeqCst);

        let identity = match self.ensure_identity().await {
            Ok(identity) => identity,
            Err(e) => {
                let mut state = self.state.write().await;
                *state = machine::step(*state, Event::RegistrationFailed).next;
                return Err(e);
            }
        };

        match self.establish(&identity).await {
            Ok(transport) => {
                {
                    let mut state = self.state.write().await;
                    *state = machine::step(*state, Event::HandshakeAcked).next;
                }
                info!("connected to broker");
                self.spawn_connection(transport).await;
                Ok(())
            }
            Err(e) => {
                {
                    let mut state = self.state.write().await;
                    *state = machine::step(*state, Event::HandshakeFailed).next;
                }
                self.spawn_reconnect();
                Err(e)
            }
        }
    }

    /// Close the connection deliberately and suppress automatic retry
    pub async fn disconnect(&self) {
        self.retry_enabled.store(false, Ordering::SeqCst);
        let mut state = self.state.write().await;
        *state = machine::step(*state, Event::DisconnectRequested).next;
        info!("disconnect requested");
    }

    /// Current status snapshot
    pub async fn status(&self) -> AgentStatus {
        let state = *self.state.read().await;
        AgentStatus {
            connected: state == ConnectionState::Connected,
            state,
            capability: self.capability.read().await.clone(),
        }
    }

    /// Total earnings accumulated by answered work items. Never fails; the
    /// persisted value is best-effort.
    pub async fn earnings(&self) -> f64 {
        *self.earnings.read().await
    }

    /// Apply a partial settings update. Changes take effect for registration
    /// payloads and for connections opened after the update.
    pub async fn update_settings(&self, update: SettingsUpdate) {
        if let Some(base_rate) = update.base_rate {
            let sheet = PriceSheet::new(base_rate);
            *self.pricing.write().await = sheet.clone();
            if let Err(e) = self.store.set_pricing(&sheet).await {
                debug!("failed to persist pricing: {}", e);
            }
        }

        if update.local_endpoint.is_some() || update.gpu.is_some() {
            let mut capability = self.capability.write().await;
            if let Some(endpoint) = update.local_endpoint {
                capability.local_endpoint = endpoint;
            }
            if let Some(gpu) = update.gpu {
                capability.gpu = gpu;
            }
            if let Err(e) = self.store.set_capability(&capability).await {
                debug!("failed to persist capability: {}", e);
            }
        }
    }

    /// Load the stored identity, registering with the broker when absent
    async fn ensure_identity(&self) -> Result<PluginIdentity> {
        if let Some(identity) = self.store.identity().await? {
            return Ok(identity);
        }

        let capability = self.capability.read().await.clone();
        let pricing = self.pricing.read().await.clone();
        let identity = self.registration.register(&capability, &pricing).await?;

        if let Err(e) = self.store.set_identity(&identity).await {
            warn!("failed to persist identity: {}", e);
        }
        Ok(identity)
    }

    /// Open a socket and complete the registration handshake. The transition
    /// to connected happens only on the broker's `connected` ack, not on
    /// socket-open.
    async fn establish(&self, identity: &PluginIdentity) -> Result<Box<dyn Transport>> {
        let mut transport = self.connector.open().await?;
        transport
            .send(Frame::Connect {
                plugin_id: identity.plugin_id.clone(),
                connection_token: identity.connection_token.clone(),
            })
            .await?;

        let handshake = async {
            loop {
                match transport.recv().await? {
                    Some(Frame::Connected) => return Ok(()),
                    Some(Frame::Heartbeat) => transport.send(Frame::Heartbeat).await?,
                    Some(other) => debug!(?other, "ignoring frame during handshake"),
                    None => {
                        return Err(AgentError::Transport(
                            "connection closed during handshake".to_string(),
                        ))
                    }
                }
            }
        };

        match timeout(self.connect_timeout, handshake).await {
            Ok(Ok(())) => Ok(transport),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AgentError::Timeout(format!(
                "no broker acknowledgement within {:?}",
                self.connect_timeout
            ))),
        }
    }

    /// Start the event loop for a freshly established connection
    async fn spawn_connection(&self, transport: Box<dyn Transport>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let session = self.clone();
        tokio::spawn(async move {
            session.run_connection(transport, generation).await;
        });
    }

    /// Per-connection event loop. Owns the transport; multiplexes inbound
    /// frames and outbound responses until the socket drops or the session
    /// leaves the connected state.
    async fn run_connection(self, mut transport: Box<dyn Transport>, generation: u64) {
        let dispatcher = Arc::new(Dispatcher::for_capability(
            &self.capability.read().await.clone(),
            self.pricing.read().await.clone(),
        ));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let mut lost = false;
        let mut last_inbound = std::time::Instant::now();

        'outer: loop {
            if *self.state.read().await != ConnectionState::Connected
                || self.generation.load(Ordering::SeqCst) != generation
            {
                transport.close().await;
                break;
            }

            // Dead-man timer: a silent broker is treated as a lost socket
            if let Some(limit) = self.heartbeat_timeout {
                if last_inbound.elapsed() > limit {
                    warn!("no frames from broker for {:?}, dropping connection", limit);
                    transport.close().await;
                    lost = true;
                    break;
                }
            }

            while let Ok(frame) = out_rx.try_recv() {
                if let Err(e) = transport.send(frame).await {
                    warn!("send failed: {}", e);
                    lost = true;
                    break 'outer;
                }
            }

            match timeout(POLL_INTERVAL, transport.recv()).await {
                Err(_) => continue, // Poll tick
                Ok(Ok(Some(frame))) => {
                    last_inbound = std::time::Instant::now();
                    if let Err(e) = self
                        .handle_frame(frame, &mut transport, &dispatcher, &out_tx)
                        .await
                    {
                        warn!("connection error: {}", e);
                        lost = true;
                        break;
                    }
                }
                Ok(Ok(None)) => {
                    info!("broker closed connection");
                    lost = true;
                    break;
                }
                Ok(Err(e)) => {
                    warn!("transport error: {}", e);
                    lost = true;
                    break;
                }
            }
        }

        if lost {
            let effect = {
                let mut state = self.state.write().await;
                let t = machine::step(*state, Event::ConnectionLost);
                *state = t.next;
                t.effect
            };
            if effect == Effect::ScheduleRetry && self.retry_enabled.load(Ordering::SeqCst) {
                self.spawn_reconnect();
            }
        }
    }

    async fn handle_frame(
        &self,
        frame: Frame,
        transport: &mut Box<dyn Transport>,
        dispatcher: &Arc<Dispatcher>,
        out_tx: &mpsc::UnboundedSender<Frame>,
    ) -> Result<()> {
        match frame {
            Frame::Heartbeat => transport.send(Frame::Heartbeat).await,
            Frame::InferenceRequest {
                request_id,
                prompt,
                model,
            } => {
                self.spawn_work(
                    WorkItem {
                        request_id,
                        prompt,
                        model,
                    },
                    dispatcher.clone(),
                    out_tx.clone(),
                );
                Ok(())
            }
            other => {
                debug!(?other, "ignoring unexpected frame");
                Ok(())
            }
        }
    }

    /// Handle a work item as a supervised task. A panic inside the dispatcher
    /// becomes an error response frame instead of an unhandled failure; if
    /// the connection is gone by completion, the result is discarded.
    fn spawn_work(
        &self,
        item: WorkItem,
        dispatcher: Arc<Dispatcher>,
        out_tx: mpsc::UnboundedSender<Frame>,
    ) {
        let session = self.clone();
        tokio::spawn(async move {
            let request_id = item.request_id.clone();
            let model = item.model.clone();

            let worker = tokio::spawn(async move { dispatcher.handle(&item).await });
            let result = match worker.await {
                Ok(result) => result,
                Err(e) => WorkResult {
                    response_text: None,
                    tokens: 0,
                    cost: 0.0,
                    error: Some(format!("worker task failed: {}", e)),
                },
            };

            let earned = result.response_text.is_some().then_some(result.cost);
            let frame = match result.response_text {
                Some(response) => Frame::InferenceResponse {
                    request_id: request_id.clone(),
                    result: Some(InferenceResult {
                        response,
                        model,
                        tokens: result.tokens,
                        cost: result.cost,
                    }),
                    error: None,
                },
                None => Frame::InferenceResponse {
                    request_id: request_id.clone(),
                    result: None,
                    error: Some(
                        result
                            .error
                            .unwrap_or_else(|| "inference failed".to_string()),
                    ),
                },
            };

            // Only delivered responses earn; a result finishing after the
            // connection dropped is discarded unpaid.
            if out_tx.send(frame).is_ok() {
                if let Some(cost) = earned {
                    session.record_earnings(cost).await;
                }
            } else {
                debug!(request_id = %request_id, "connection gone, discarding result");
            }
        });
    }

    async fn record_earnings(&self, cost: f64) {
        let total = {
            let mut earnings = self.earnings.write().await;
            *earnings += cost;
            *earnings
        };
        if let Err(e) = self.store.set_earnings(total).await {
            debug!("failed to persist earnings: {}", e);
        }
    }

    /// Background reconnection with exponential backoff. Stops when retry is
    /// suppressed, attempts are exhausted, or a connection is established.
    fn spawn_reconnect(&self) {
        let session = self.clone();
        tokio::spawn(async move {
            let mut backoff = ExponentialBackoff::new(
                session.reconnect_delay,
                session.max_reconnect_delay,
                session.max_reconnect_attempts,
            );

            loop {
                if !session.retry_enabled.load(Ordering::SeqCst) {
                    return;
                }
                let Some(delay) = backoff.next_delay() else {
                    warn!("reconnection attempts exhausted");
                    return;
                };
                info!(attempt = backoff.attempt(), ?delay, "waiting before reconnecting");
                tokio::time::sleep(delay).await;
                if !session.retry_enabled.load(Ordering::SeqCst) {
                    return;
                }

                {
                    let mut state = session.state.write().await;
                    let t = machine::step(*state, Event::RetryElapsed);
                    if t.effect != Effect::BeginHandshake {
                        // Someone else moved the machine; stand down.
                        return;
                    }
                    *state = t.next;
                }

                let attempt = async {
                    let identity = session.ensure_identity().await?;
                    session.establish(&identity).await
                }
                .await;

                match attempt {
                    Ok(transport) => {
                        {
                            let mut state = session.state.write().await;
                            *state = machine::step(*state, Event::HandshakeAcked).next;
                        }
                        info!("reconnected to broker");
                        session.spawn_connection(transport).await;
                        return;
                    }
                    Err(e) => {
                        warn!("reconnection attempt failed: {}", e);
                        let mut state = session.state.write().await;
                        *state = machine::step(*state, Event::HandshakeFailed).next;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn open(&self) -> Result<Box<dyn Transport>> {
            Err(AgentError::Transport("connection refused".to_string()))
        }
    }

    fn config() -> AgentConfig {
        AgentConfig {
            broker_http_url: "http://127.0.0.1:1".to_string(),
            max_reconnect_attempts: 1,
            reconnect_delay_secs: 0,
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn test_initial_status_is_idle() {
        let session = AgentSession::new(
            &config(),
            Arc::new(RefusingConnector),
            Arc::new(MemoryStore::new()),
            Capability::default(),
        )
        .await;
        let status = session.status().await;
        assert!(!status.connected);
        assert_eq!(status.state, ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_registration_failure_stays_idle() {
        // No stored identity, unreachable registration endpoint.
        let session = AgentSession::new(
            &config(),
            Arc::new(RefusingConnector),
            Arc::new(MemoryStore::new()),
            Capability::default(),
        )
        .await;
        let result = session.connect().await;
        assert!(matches!(result, Err(AgentError::Registration(_))));
        assert_eq!(session.status().await.state, ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_disconnected() {
        let store = Arc::new(MemoryStore::new());
        store
            .set_identity(&PluginIdentity {
                plugin_id: "p".to_string(),
                connection_token: "t".to_string(),
            })
            .await
            .unwrap();

        let session = AgentSession::new(
            &config(),
            Arc::new(RefusingConnector),
            store,
            Capability::default(),
        )
        .await;
        let result = session.connect().await;
        assert!(matches!(result, Err(AgentError::Transport(_))));
        assert_eq!(session.status().await.state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_settings_update_applies_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let session = AgentSession::new(
            &config(),
            Arc::new(RefusingConnector),
            store.clone(),
            Capability::default(),
        )
        .await;

        session
            .update_settings(SettingsUpdate {
                base_rate: Some(0.002),
                gpu: Some(Some("RTX 4090".to_string())),
                ..SettingsUpdate::default()
            })
            .await;

        assert_eq!(
            store.pricing().await.unwrap(),
            Some(PriceSheet::new(0.002))
        );
        assert_eq!(
            session.status().await.capability.gpu.as_deref(),
            Some("RTX 4090")
        );
    }

    #[tokio::test]
    async fn test_result_after_connection_drop_earns_nothing() {
        let session = AgentSession::new(
            &config(),
            Arc::new(RefusingConnector),
            Arc::new(MemoryStore::new()),
            Capability::default(),
        )
        .await;

        let dispatcher = Arc::new(Dispatcher::with_providers(
            vec![Arc::new(crate::dispatch::SyntheticProvider)],
            PriceSheet::default(),
        ));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        // Connection already gone by the time the work completes.
        drop(out_rx);

        session.spawn_work(
            WorkItem {
                request_id: "r1".to_string(),
                prompt: "hello".to_string(),
                model: "m".to_string(),
            },
            dispatcher,
            out_tx,
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(session.earnings().await, 0.0);
    }

    #[tokio::test]
    async fn test_delivered_result_earns() {
        let session = AgentSession::new(
            &config(),
            Arc::new(RefusingConnector),
            Arc::new(MemoryStore::new()),
            Capability::default(),
        )
        .await;

        let dispatcher = Arc::new(Dispatcher::with_providers(
            vec![Arc::new(crate::dispatch::SyntheticProvider)],
            PriceSheet::default(),
        ));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        session.spawn_work(
            WorkItem {
                request_id: "r1".to_string(),
                prompt: "hello".to_string(),
                model: "m".to_string(),
            },
            dispatcher,
            out_tx,
        );

        let frame = tokio::time::timeout(Duration::from_secs(5), out_rx.recv())
            .await
            .expect("timed out")
            .expect("sender dropped");
        let cost = match frame {
            Frame::InferenceResponse { result, .. } => result.expect("must answer").cost,
            other => panic!("expected inference response, got {:?}", other),
        };

        // Crediting happens after the frame is handed off; poll briefly.
        tokio::time::timeout(Duration::from_secs(5), async {
            while (session.earnings().await - cost).abs() > f64::EPSILON {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("earnings never credited");
    }

    #[tokio::test]
    async fn test_earnings_start_at_zero_and_accumulate() {
        let session = AgentSession::new(
            &config(),
            Arc::new(RefusingConnector),
            Arc::new(MemoryStore::new()),
            Capability::default(),
        )
        .await;
        assert_eq!(session.earnings().await, 0.0);
        session.record_earnings(0.5).await;
        session.record_earnings(0.25).await;
        assert_eq!(session.earnings().await, 0.75);
    }
}
