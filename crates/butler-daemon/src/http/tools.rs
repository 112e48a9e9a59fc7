use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppState;

#[derive(Deserialize)]
pub struct ToolCallBody {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// `POST /api/tools/call` — the daemon-local tool surface.
///
/// Every call goes through the module gate: tools of disabled modules return
/// the structured `module_disabled` shape with HTTP 200, exactly as an MCP
/// client would see it.
pub async fn call_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ToolCallBody>,
) -> (StatusCode, Json<Value>) {
    match state.tools.call(&body.name, body.arguments).await {
        Some(result) => (StatusCode::OK, Json(result)),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown tool", "tool": body.name})),
        ),
    }
}
