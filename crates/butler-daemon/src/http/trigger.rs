use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppState;

#[derive(Deserialize)]
pub struct TriggerBody {
    pub prompt: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub traceparent: Option<String>,
}

/// `POST /api/trigger` — how the switchboard hands a routed message to this
/// butler. Spawns an ephemeral runtime session and returns its outcome.
pub async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TriggerBody>,
) -> (StatusCode, Json<Value>) {
    if !state.accepting_connections.load(Ordering::Acquire) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "shutting down"})),
        );
    }
    let parent = body
        .traceparent
        .as_deref()
        .and_then(butler_telemetry::TraceParent::parse);

    match state
        .spawner
        .trigger(
            &body.prompt,
            "external",
            body.context.as_deref(),
            None,
            parent,
            body.request_id.as_deref(),
        )
        .await
    {
        Ok(result) => {
            let status = if result.success {
                StatusCode::OK
            } else {
                StatusCode::BAD_GATEWAY
            };
            (
                status,
                Json(json!({
                    "success": result.success,
                    "output": result.output,
                    "error": result.error,
                    "session_id": result.session_id.map(|id| id.to_string()),
                    "duration_ms": result.duration_ms,
                })),
            )
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": e.to_string()})),
        ),
    }
}
