use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

pub async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let accepting = state.accepting_connections.load(Ordering::Acquire);
    let status = if accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "butler": state.config.name,
            "accepting": accepting,
            "in_flight_sessions": state.spawner.in_flight_count(),
            "queue_depth": state.buffer.as_ref().map(|b| b.depth()),
        })),
    )
}
