use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use butler_modules::StateChangeError;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/butlers/{name}/module-states`.
pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<Value>) {
    if name != state.config.name {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown butler", "butler": name})),
        );
    }
    let states = state.module_states.get_module_states();
    (
        StatusCode::OK,
        Json(serde_json::to_value(states).unwrap_or(Value::Null)),
    )
}

#[derive(Deserialize)]
pub struct SetEnabledBody {
    pub enabled: bool,
}

/// `PUT /api/butlers/{name}/module-states/{module}/enabled`.
///
/// 404 unknown butler/module, 409 when the module's health is `failed`. The
/// daemon's answer is authoritative — the dashboard only relays it.
pub async fn set_enabled_handler(
    State(state): State<Arc<AppState>>,
    Path((name, module)): Path<(String, String)>,
    Json(body): Json<SetEnabledBody>,
) -> (StatusCode, Json<Value>) {
    if name != state.config.name {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown butler", "butler": name})),
        );
    }
    match state.module_states.set_module_enabled(&module, body.enabled) {
        Ok(updated) => (
            StatusCode::OK,
            Json(serde_json::to_value(updated).unwrap_or(Value::Null)),
        ),
        Err(StateChangeError::UnknownModule(m)) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown module", "module": m})),
        ),
        Err(StateChangeError::Unavailable(m)) => (
            StatusCode::CONFLICT,
            Json(json!({"error": "module unavailable", "module": m})),
        ),
        Err(StateChangeError::Database(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}
