use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};

use crate::state::AppState;

pub mod health;
pub mod heartbeat;
pub mod ingest;
pub mod module_states;
pub mod oauth;
pub mod tools;
pub mod trigger;

/// Assemble the daemon's Axum router. Switchboard-only routes are mounted on
/// every daemon but answer 404 off the switchboard.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/ingest", post(ingest::ingest_handler))
        .route(
            "/api/switchboard/heartbeat",
            post(heartbeat::liveness_handler),
        )
        .route(
            "/api/switchboard/connector-heartbeat",
            post(heartbeat::connector_heartbeat_handler),
        )
        .route(
            "/api/butlers/{name}/module-states",
            get(module_states::list_handler),
        )
        .route(
            "/api/butlers/{name}/module-states/{module}/enabled",
            put(module_states::set_enabled_handler),
        )
        .route("/api/trigger", post(trigger::trigger_handler))
        .route("/api/tools/call", post(tools::call_handler))
        .route("/api/oauth/google/start", get(oauth::start_handler))
        .route("/api/oauth/google/callback", get(oauth::callback_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
