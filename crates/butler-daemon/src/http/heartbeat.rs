use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::state::AppState;

#[derive(Deserialize)]
pub struct LivenessBody {
    pub butler_name: String,
}

/// `POST /api/switchboard/heartbeat` — butler liveness reports.
pub async fn liveness_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LivenessBody>,
) -> (StatusCode, Json<Value>) {
    if !state.config.is_switchboard() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not the switchboard"})),
        );
    }
    match butler_switchboard::catalog::record_heartbeat(&state.db, &body.butler_name) {
        Ok(eligibility_state) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "eligibility_state": eligibility_state})),
        ),
        Err(e) => {
            warn!(error = %e, butler = %body.butler_name, "heartbeat record failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal_error"})),
            )
        }
    }
}

/// `POST /api/switchboard/connector-heartbeat` — connector self-reports.
/// Routed through the gated `connector.heartbeat` tool so the envelope is
/// handled exactly like an MCP submission.
pub async fn connector_heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if !state.config.is_switchboard() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not the switchboard"})),
        );
    }
    let schema = envelope
        .get("schema_version")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if schema != butler_protocol::heartbeat::HEARTBEAT_SCHEMA_VERSION {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "validation_error", "message": "unsupported schema_version"})),
        );
    }
    info!(
        connector = envelope
            .pointer("/connector/connector_type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown"),
        "connector heartbeat accepted"
    );
    match state.tools.call("connector.heartbeat", envelope).await {
        Some(result) => (StatusCode::OK, Json(result)),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "heartbeat tool missing"})),
        ),
    }
}
