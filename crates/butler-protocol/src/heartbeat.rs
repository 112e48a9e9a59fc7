use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const HEARTBEAT_SCHEMA_VERSION: &str = "connector.heartbeat.v1";

/// Periodic connector self-report delivered to the switchboard's
/// `connector.heartbeat` tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatEnvelope {
    pub schema_version: String,
    pub connector: ConnectorBlock,
    pub status: StatusBlock,
    pub counters: CounterBlock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointBlock>,
    /// Omitted entirely when the connector reports no capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Value>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorBlock {
    pub connector_type: String,
    pub endpoint_identity: String,
    /// Stable per-process id minted at connector start.
    pub instance_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusBlock {
    pub state: HealthState,
    pub uptime_s: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Error,
}

/// Counter snapshot scraped from the connector's local metric registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CounterBlock {
    pub messages_ingested: u64,
    pub messages_failed: u64,
    pub dedupe_accepted: u64,
    pub source_api_calls: u64,
    pub checkpoint_saves: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointBlock {
    pub cursor: Value,
    pub saved_at: DateTime<Utc>,
}

impl HeartbeatEnvelope {
    /// Normalise an empty capabilities object to omission — the wire contract
    /// says the key is absent when there is nothing to report.
    pub fn with_capabilities(mut self, capabilities: Option<Value>) -> Self {
        self.capabilities = capabilities.filter(|v| match v {
            Value::Null => false,
            Value::Object(m) => !m.is_empty(),
            _ => true,
        });
        self
    }
}
