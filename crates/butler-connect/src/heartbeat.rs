use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use butler_protocol::heartbeat::{
    CheckpointBlock, ConnectorBlock, CounterBlock, HealthState, HeartbeatEnvelope, StatusBlock,
    HEARTBEAT_SCHEMA_VERSION,
};
use butler_telemetry::MetricRegistry;
use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub const MIN_INTERVAL_S: u64 = 30;
pub const DEFAULT_INTERVAL_S: u64 = 60;
pub const MAX_INTERVAL_S: u64 = 300;
/// The first heartbeat fires within this many seconds of start.
const INITIAL_DELAY_S: u64 = 2;

/// Clamp a configured interval into the allowed band.
pub fn clamp_interval(requested: u64) -> u64 {
    requested.clamp(MIN_INTERVAL_S, MAX_INTERVAL_S)
}

/// Truthy/falsy string parsing for `CONNECTOR_HEARTBEAT_ENABLED`.
/// Unrecognised values (and absence) leave heartbeats on.
pub fn parse_enabled(raw: Option<&str>) -> bool {
    match raw.map(|s| s.trim().to_lowercase()) {
        Some(v) if ["0", "false", "no", "off"].contains(&v.as_str()) => false,
        _ => true,
    }
}

/// Where heartbeat envelopes go — the switchboard's `connector.heartbeat`
/// tool in production, a recorder in tests.
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    async fn send(&self, envelope: &HeartbeatEnvelope) -> Result<(), String>;
}

/// Posts heartbeats to the switchboard ingest API surface.
pub struct HttpHeartbeatSink {
    client: reqwest::Client,
    url: String,
}

impl HttpHeartbeatSink {
    pub fn new(switchboard_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!(
                "{}/api/switchboard/connector-heartbeat",
                switchboard_url.trim_end_matches('/')
            ),
        }
    }
}

#[async_trait]
impl HeartbeatSink for HttpHeartbeatSink {
    async fn send(&self, envelope: &HeartbeatEnvelope) -> Result<(), String> {
        let response = self
            .client
            .post(&self.url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("switchboard answered {}", response.status()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatTaskConfig {
    pub connector_type: String,
    pub endpoint_identity: String,
    pub interval_s: u64,
    pub enabled: bool,
    pub version: Option<String>,
}

type HealthFn = Arc<dyn Fn() -> (HealthState, Option<String>) + Send + Sync>;
type CheckpointFn = Arc<dyn Fn() -> Option<CheckpointBlock> + Send + Sync>;
type CapabilitiesFn = Arc<dyn Fn() -> Option<Value> + Send + Sync>;

/// Everything needed to mint one envelope; shared with the loop task.
struct BeatState {
    config: HeartbeatTaskConfig,
    instance_id: Uuid,
    started_at: Instant,
    registry: Arc<MetricRegistry>,
    get_health_state: HealthFn,
    get_checkpoint: Option<CheckpointFn>,
    get_capabilities: Option<CapabilitiesFn>,
}

impl BeatState {
    fn build_envelope(&self) -> HeartbeatEnvelope {
        let (state, error_message) = (self.get_health_state)();
        let envelope = HeartbeatEnvelope {
            schema_version: HEARTBEAT_SCHEMA_VERSION.to_string(),
            connector: ConnectorBlock {
                connector_type: self.config.connector_type.clone(),
                endpoint_identity: self.config.endpoint_identity.clone(),
                instance_id: self.instance_id,
                version: self.config.version.clone(),
            },
            status: StatusBlock {
                state,
                uptime_s: self.started_at.elapsed().as_secs(),
                error_message,
            },
            counters: CounterBlock {
                messages_ingested: self.registry.counter_value("messages_ingested"),
                messages_failed: self.registry.counter_value("messages_failed"),
                dedupe_accepted: self.registry.counter_value("dedupe_accepted"),
                source_api_calls: self.registry.counter_value("source_api_calls"),
                checkpoint_saves: self.registry.counter_value("checkpoint_saves"),
            },
            checkpoint: self.get_checkpoint.as_ref().and_then(|f| f()),
            capabilities: None,
            sent_at: Utc::now(),
        };
        envelope.with_capabilities(self.get_capabilities.as_ref().and_then(|f| f()))
    }
}

/// Periodic connector self-report task.
///
/// The loop never dies: sink errors are logged at WARN and the next beat
/// proceeds on schedule. `stop()` cancels and awaits the task.
pub struct ConnectorHeartbeat {
    state: Arc<BeatState>,
    sink: Arc<dyn HeartbeatSink>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ConnectorHeartbeat {
    pub fn new(
        config: HeartbeatTaskConfig,
        registry: Arc<MetricRegistry>,
        sink: Arc<dyn HeartbeatSink>,
        get_health_state: HealthFn,
    ) -> Self {
        Self {
            state: Arc::new(BeatState {
                config,
                // Stable for the process lifetime so the switchboard can tell
                // restarts from concurrent instances.
                instance_id: Uuid::new_v4(),
                started_at: Instant::now(),
                registry,
                get_health_state,
                get_checkpoint: None,
                get_capabilities: None,
            }),
            sink,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn with_checkpoint_fn(mut self, f: CheckpointFn) -> Self {
        Arc::get_mut(&mut self.state)
            .expect("checkpoint fn must be set before start")
            .get_checkpoint = Some(f);
        self
    }

    pub fn with_capabilities_fn(mut self, f: CapabilitiesFn) -> Self {
        Arc::get_mut(&mut self.state)
            .expect("capabilities fn must be set before start")
            .get_capabilities = Some(f);
        self
    }

    pub fn instance_id(&self) -> Uuid {
        self.state.instance_id
    }

    /// Build one heartbeat envelope from current state.
    pub fn build_envelope(&self) -> HeartbeatEnvelope {
        self.state.build_envelope()
    }

    /// Start the loop. Initial delay ≤ 5 s, then every `interval_s`
    /// (clamped). Disabled config makes this a no-op.
    pub fn start(&mut self) {
        if !self.state.config.enabled {
            info!("connector heartbeat disabled by config");
            return;
        }
        let interval = Duration::from_secs(clamp_interval(self.state.config.interval_s));
        let cancel = self.cancel.clone();
        let sink = self.sink.clone();
        let state = self.state.clone();

        self.handle = Some(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(INITIAL_DELAY_S)) => {}
                _ = cancel.cancelled() => return,
            }
            loop {
                let envelope = state.build_envelope();
                if let Err(e) = sink.send(&envelope).await {
                    warn!(error = %e, "heartbeat send failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => {
                        info!("connector heartbeat stopped");
                        return;
                    }
                }
            }
        }));
    }

    /// Cancel and await the loop task.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
