use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use butler_core::config::ButlerConfig;
use butler_db::Db;
use butler_modules::{ModuleStateController, ToolRegistry};
use butler_runtime::Spawner;
use butler_switchboard::DurableBuffer;
use butler_telemetry::ButlerMetrics;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: ButlerConfig,
    pub db: Db,
    pub metrics: ButlerMetrics,
    pub module_states: Arc<ModuleStateController>,
    pub tools: Arc<ToolRegistry>,
    pub spawner: Arc<Spawner>,
    /// Present only on the switchboard daemon.
    pub buffer: Option<Arc<DurableBuffer>>,
    /// Flipped at shutdown so the HTTP edge answers 503 while draining.
    pub accepting_connections: AtomicBool,
    /// One-time OAuth state tokens with TTL.
    pub oauth_states: crate::http::oauth::OAuthStateStore,
}
