use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use butler_protocol::envelope::IngestionTier;
use butler_switchboard::ingest::{ingest_v1, load_inbox_row};
use butler_switchboard::triage::load_rules;
use butler_switchboard::QueueItem;
use serde_json::{json, Value};
use tracing::warn;

use crate::state::AppState;

/// `POST /api/ingest` — the switchboard's `ingest.v1` boundary.
///
/// Admission is synchronous; the durable-buffer enqueue that follows decides
/// hot vs cold path but never fails the request (the row is already durable).
pub async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if !state.config.is_switchboard() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not the switchboard"})),
        );
    }
    if !state.accepting_connections.load(Ordering::Acquire) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "shutting down"})),
        );
    }

    let t0 = Instant::now();
    let rules = match load_rules(&state.db) {
        Ok(rules) => rules,
        Err(e) => {
            warn!(error = %e, "triage rules unavailable; admission continues fail-open");
            Vec::new()
        }
    };

    let response = match ingest_v1(
        &state.db,
        &payload,
        Some(&rules),
        true,
        None,
        true,
        Some(&state.metrics),
    ) {
        Ok(response) => response,
        Err(butler_switchboard::SwitchboardError::Validation(message)) => {
            state.metrics.messages_failed_inc();
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "validation_error", "message": message})),
            );
        }
        Err(e) => {
            state.metrics.messages_failed_inc();
            warn!(error = %e, "ingest failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal_error"})),
            );
        }
    };
    state
        .metrics
        .record_accept_latency(t0.elapsed().as_millis() as u64);

    // Admission done; decide whether the message enters the routing queue.
    if !response.duplicate && should_enqueue(response.triage_decision.as_deref()) {
        if let Err(e) = enqueue_admitted(&state, &response.request_id.to_string(), &response).await {
            // The message_inbox row stands; the recovery path owns it now.
            warn!(error = %e, "post-admission enqueue failed");
        }
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::to_value(&response).unwrap_or(Value::Null)),
    )
}

/// `skip` drops, `metadata_only` stays out of the LLM path; everything else
/// (including triage `route_to`, which the pipeline honors directly) queues.
fn should_enqueue(triage_decision: Option<&str>) -> bool {
    !matches!(triage_decision, Some("skip") | Some("metadata_only"))
}

async fn enqueue_admitted(
    state: &Arc<AppState>,
    request_id: &str,
    response: &butler_protocol::envelope::IngestAcceptedResponse,
) -> Result<(), String> {
    let Some(buffer) = state.buffer.as_ref() else {
        return Err("buffer not running".to_string());
    };
    let Some((context, text)) = load_inbox_row(&state.db, request_id).map_err(|e| e.to_string())?
    else {
        return Err(format!("admitted row {request_id} not found"));
    };
    if context.ingestion_tier != IngestionTier::Full {
        return Ok(());
    }

    let event = json!({
        "external_thread_id": context.source_thread_identity,
        "observed_at": context.received_at.to_rfc3339(),
        "endpoint_identity": context.source_endpoint_identity,
    });
    buffer
        .enqueue(QueueItem {
            request_id: request_id.to_string(),
            message_inbox_id: request_id.to_string(),
            message_text: text,
            source: context.source_channel,
            event: event.to_string(),
            sender: context.source_sender_identity,
            triage_target: response.triage_target.clone(),
        })
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}
