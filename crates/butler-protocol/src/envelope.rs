use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const INGEST_SCHEMA_VERSION: &str = "ingest.v1";

/// Connector submission envelope.
/// Wire: see `tests/wire_compat.rs` for the canonical JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestEnvelopeV1 {
    pub schema_version: String,
    pub source: SourceBlock,
    pub event: EventBlock,
    pub sender: SenderBlock,
    pub payload: PayloadBlock,
    #[serde(default)]
    pub control: ControlBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceBlock {
    /// Logical channel: "telegram", "email", "whatsapp", "api", …
    pub channel: String,
    /// Concrete provider behind the channel: "telegram", "gmail", …
    pub provider: String,
    /// The receiving endpoint ("@assistant_bot", "user@example.com").
    pub endpoint_identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_thread_id: Option<String>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SenderBlock {
    pub identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PayloadBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    pub normalized_text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Attachment {
    pub media_type: String,
    pub storage_ref: String,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ControlBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// W3C traceparent string carried through routing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<String>,
    #[serde(default)]
    pub policy_tier: PolicyTier,
    #[serde(default)]
    pub ingestion_tier: IngestionTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyTier {
    #[default]
    Default,
    Interactive,
    HighPriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IngestionTier {
    /// Standard pipeline.
    #[default]
    Full,
    /// Metadata-only: persisted but the LLM classifier is bypassed.
    Metadata,
    /// Dropped after admission.
    Skip,
}

impl IngestionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionTier::Full => "full",
            IngestionTier::Metadata => "metadata",
            IngestionTier::Skip => "skip",
        }
    }
}

/// Validate and parse a raw JSON value as an `ingest.v1` envelope.
///
/// Unknown fields and a wrong `schema_version` are rejected — connectors must
/// never submit shapes the switchboard does not understand.
pub fn parse_ingest_envelope(raw: &Value) -> Result<IngestEnvelopeV1, EnvelopeError> {
    let envelope: IngestEnvelopeV1 = serde_json::from_value(raw.clone())
        .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    if envelope.schema_version != INGEST_SCHEMA_VERSION {
        return Err(EnvelopeError::SchemaVersion(envelope.schema_version));
    }
    if envelope.sender.identity.trim().is_empty() {
        return Err(EnvelopeError::Malformed("sender.identity must not be empty".into()));
    }
    if envelope.source.channel.trim().is_empty() || envelope.source.endpoint_identity.trim().is_empty()
    {
        return Err(EnvelopeError::Malformed(
            "source.channel and source.endpoint_identity must not be empty".into(),
        ));
    }
    Ok(envelope)
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed ingest envelope: {0}")]
    Malformed(String),
    #[error("unsupported schema_version: {0}")]
    SchemaVersion(String),
}

/// Response payload for accepted ingest submissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestAcceptedResponse {
    pub request_id: Uuid,
    pub status: String,
    pub duplicate: bool,
    /// Deterministic triage decision; None for duplicates (triage was applied
    /// on first admission).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triage_decision: Option<String>,
    /// Target butler, populated only when triage_decision = "route_to".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triage_target: Option<String>,
}

impl IngestAcceptedResponse {
    pub fn accepted(request_id: Uuid, duplicate: bool) -> Self {
        Self {
            request_id,
            status: "accepted".to_string(),
            duplicate,
            triage_decision: None,
            triage_target: None,
        }
    }
}

/// Canonical immutable request context assigned at admission and propagated
/// through routing and fanout as the `request_context` JSON column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub received_at: DateTime<Utc>,
    pub source_channel: String,
    pub source_endpoint_identity: String,
    pub source_sender_identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_thread_identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<String>,
    pub ingestion_tier: IngestionTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triage: Option<TriageAnnotation>,
}

/// Triage outcome embedded in the request context for pipeline visibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageAnnotation {
    pub decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_butler: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
