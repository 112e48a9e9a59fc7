use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use butler_core::config::ButlerConfig;
use butler_credentials::{
    backfill_shared_secrets, scan_config_for_secrets, validate_credentials, CredentialStore,
    RequiredCredentials,
};
use butler_db::{run_migrations, Db};
use butler_memory::{memory_context, MemoryKind, MemoryStore, Permanence};
use butler_modules::{
    shutdown_modules, start_modules, Module, ModuleRegistry, ModuleStateController, ToolRegistry,
};
use butler_runtime::{
    ClaudeCliAdapter, GeminiCliAdapter, MemoryHooks, RuntimeAdapter, Spawner,
};
use butler_scheduler::{sync_schedules, SchedulerEngine};
use butler_sessions::SessionStore;
use butler_switchboard::db::SWITCHBOARD_CHAIN;
use butler_switchboard::routing::{ClassifierOutcome, DispatchFn, ForwardFn, RoutingPipeline};
use butler_switchboard::{DurableBuffer, QueueItem};
use butler_telemetry::init_telemetry;
use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::http;
use crate::state::AppState;

/// Built-in modules available to every butler. Domain repos extend this via
/// their own binaries; the core ships the memory module.
pub fn default_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register(Arc::new(MemoryModule));
    registry
}

/// Composes the whole daemon: databases, credentials, modules, spawner,
/// scheduler, switchboard plumbing, and the HTTP edge.
pub struct ButlerDaemon {
    config: ButlerConfig,
    config_dir: PathBuf,
    registry: ModuleRegistry,
}

/// Handles held for the lifetime of a started daemon.
pub struct RunningDaemon {
    pub state: Arc<AppState>,
    /// The actually bound address (config port 0 picks an ephemeral one).
    pub local_addr: std::net::SocketAddr,
    started_modules: Vec<Arc<dyn Module>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    liveness: Option<butler_connect::LivenessReporter>,
}

impl ButlerDaemon {
    pub fn new(config: ButlerConfig, config_dir: PathBuf, registry: ModuleRegistry) -> Self {
        Self {
            config,
            config_dir,
            registry,
        }
    }

    pub async fn start(self) -> anyhow::Result<RunningDaemon> {
        let config = self.config;

        // Telemetry is process-global and installed at most once; a second
        // butler in this process reuses the first installation.
        init_telemetry(&config.name);

        // Databases + credential chain.
        let db = Db::open(&config.db.path_for(&config.name)).context("open butler database")?;
        let shared = Db::open(&config.db.shared_path()).context("open shared database")?;
        let mut credentials = CredentialStore::new(db.clone())?.with_fallback("shared", shared.clone())?;
        if let Some(ref legacy_path) = config.db.legacy_shared_path {
            let legacy = Db::open(legacy_path).context("open legacy shared database")?;
            let copied = backfill_shared_secrets(&legacy, &shared)?;
            if copied > 0 {
                info!(copied, "legacy shared secrets backfilled");
            }
            credentials = credentials.with_fallback("legacy", legacy)?;
        }
        let credentials = Arc::new(credentials);

        // Modules in dependency order, then aggregated credential validation.
        let modules = self
            .registry
            .load_from_config(&config.modules)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let mut required = RequiredCredentials {
            butler_env: config.env_required.clone(),
            optional: config.env_optional.clone(),
            ..RequiredCredentials::default()
        };
        for module in &modules {
            let vars = module.credentials_env();
            if !vars.is_empty() {
                required.modules.insert(module.name().to_string(), vars);
            }
        }
        validate_credentials(&credentials, &required)?;
        for warning in scan_config_for_secrets(&serde_json::to_value(&config.modules)?) {
            warn!(path = %warning.path, reason = warning.reason, "possible secret literal in config");
        }

        // Core + per-module migrations.
        if config.is_switchboard() {
            run_migrations(&db, &SWITCHBOARD_CHAIN)?;
            butler_sessions::audit::init_db(&db)?;
        }
        for module in &modules {
            if let Some(chain) = module.migration_chain() {
                run_migrations(&db, &chain)?;
            }
        }

        // Tool surface behind the gate.
        let module_states = Arc::new(ModuleStateController::new(db.clone())?);
        let tools = Arc::new(ToolRegistry::new(module_states.clone()));

        // Spawner stack.
        let sessions = Arc::new(SessionStore::new(db.clone())?);
        let adapter: Arc<dyn RuntimeAdapter> = match config.runtime.adapter.as_str() {
            "gemini" => Arc::new(GeminiCliAdapter::new("gemini")),
            _ => Arc::new(ClaudeCliAdapter::new("claude")),
        };
        let mut module_credentials: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for module in &modules {
            module_credentials.insert(module.name().to_string(), module.credentials_env());
        }
        let mut spawner = Spawner::new(config.clone(), self.config_dir.clone(), adapter)
            .with_sessions(sessions.clone())
            .with_module_credentials(module_credentials);
        if config.is_switchboard() {
            spawner = spawner.with_audit_db(db.clone());
        }
        if config.memory_enabled() {
            let store = Arc::new(MemoryStore::new(db.clone())?);
            spawner = spawner.with_memory_hooks(Arc::new(StoreBackedHooks {
                store,
                butler: config.name.clone(),
            }));
        }
        let spawner = Arc::new(spawner);

        register_core_tools(&tools, &spawner, &module_states, &config, &db);

        // Module startup with reverse cleanup on failure.
        let started_modules = start_modules(
            &modules,
            &config.modules,
            &db,
            Some(credentials.as_ref()),
            &module_states,
            &tools,
        )
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Scheduler: durable sync, tick engine, and the dispatch loop that
        // feeds fired schedules into the spawner.
        sync_schedules(&db, &config.schedules)?;
        let (fired_tx, mut fired_rx) = mpsc::channel(16);
        let engine = SchedulerEngine::new(db.clone(), fired_tx)?;
        tasks.push(tokio::spawn(engine.run(shutdown_rx.clone())));
        {
            let spawner = spawner.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(fired) = fired_rx.recv().await {
                    let source = fired.trigger_source();
                    if let Err(e) = spawner
                        .trigger(&fired.prompt, &source, None, None, None, None)
                        .await
                    {
                        warn!(schedule = %fired.name, error = %e, "scheduled trigger rejected");
                    }
                }
            }));
        }

        // Switchboard-only plumbing: durable buffer + routing pipeline.
        let buffer = if config.is_switchboard() {
            let buffer = Arc::new(DurableBuffer::new(
                db.clone(),
                &config.name,
                config.buffer.clone(),
                spawner.metrics().clone(),
            ));
            let pipeline = Arc::new(RoutingPipeline::new(
                db.clone(),
                config.routing.clone(),
                spawner.metrics().clone(),
                classifier_dispatch(spawner.clone()),
                http_forwarder(db.clone()),
            ));
            let process: butler_switchboard::buffer::ProcessFn = {
                let pipeline = pipeline.clone();
                Arc::new(move |item: QueueItem| {
                    let pipeline = pipeline.clone();
                    async move { pipeline.process(item).await.map(|_| ()) }.boxed()
                })
            };
            // run() performs the startup route_inbox recovery scan.
            tasks.extend(buffer.run(process, shutdown_rx.clone()).await);
            Some(buffer)
        } else {
            None
        };

        let state = Arc::new(AppState {
            config: config.clone(),
            db: db.clone(),
            metrics: spawner.metrics().clone(),
            module_states,
            tools,
            spawner: spawner.clone(),
            buffer,
            accepting_connections: AtomicBool::new(true),
            oauth_states: http::oauth::OAuthStateStore::new(Duration::from_secs(600)),
        });

        // HTTP edge.
        let router = http::build_router(state.clone());
        let addr = format!("127.0.0.1:{}", config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        let local_addr = listener.local_addr()?;
        info!(butler = %config.name, addr = %local_addr, "butler daemon listening");
        tasks.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "http server stopped");
            }
        }));

        // Liveness toward the switchboard (not from the switchboard itself).
        let liveness = if config.is_switchboard() {
            None
        } else {
            let mut reporter = butler_connect::LivenessReporter::new(
                &config.name,
                &config.switchboard_url,
                config.heartbeat.interval_seconds,
            );
            reporter.start();
            Some(reporter)
        };

        Ok(RunningDaemon {
            state,
            local_addr,
            started_modules,
            shutdown_tx,
            tasks,
            liveness,
        })
    }
}

impl RunningDaemon {
    /// Graceful shutdown: stop admitting, drain sessions, unwind modules,
    /// then stop the background loops.
    pub async fn shutdown(mut self) {
        let timeout = Duration::from_secs(self.state.config.shutdown.timeout_s);
        self.state
            .accepting_connections
            .store(false, Ordering::Release);
        self.state.spawner.stop_accepting();
        self.state.spawner.drain(timeout).await;

        shutdown_modules(&self.started_modules).await;

        let _ = self.shutdown_tx.send(true);
        if let Some(ref mut reporter) = self.liveness {
            reporter.stop().await;
        }
        for task in &self.tasks {
            task.abort();
        }
        info!(butler = %self.state.config.name, "daemon stopped");
    }
}

/// The classifier runs on this daemon's own spawner; its routing decision is
/// whatever `route_to_butler` calls the session emitted.
fn classifier_dispatch(spawner: Arc<Spawner>) -> DispatchFn {
    Arc::new(move |prompt: String| {
        let spawner = spawner.clone();
        async move {
            let result = spawner
                .trigger(&prompt, "external", None, None, None, None)
                .await
                .map_err(|e| e.to_string())?;
            Ok(ClassifierOutcome {
                success: result.success,
                tool_calls: result.tool_calls,
            })
        }
        .boxed()
    })
}

/// Forward a routed message to the target butler's trigger endpoint, as
/// registered in the catalog. Errors bubble up so the buffer retries.
fn http_forwarder(db: Db) -> ForwardFn {
    let client = reqwest::Client::new();
    Arc::new(move |butler: String, item: QueueItem| {
        let (db, client) = (db.clone(), client.clone());
        async move {
            let endpoint: Option<String> = db
                .with({
                    let butler = butler.clone();
                    move |conn| {
                        conn.query_row(
                            "SELECT endpoint_url FROM butlers WHERE name = ?1",
                            [butler.as_str()],
                            |row| row.get(0),
                        )
                        .or_else(|e| match e {
                            rusqlite::Error::QueryReturnedNoRows => Ok(None),
                            other => Err(other),
                        })
                    }
                })
                .map_err(|e| e.to_string())?;
            let Some(endpoint) = endpoint else {
                return Err(format!("butler '{butler}' has no registered endpoint"));
            };

            let response = client
                .post(format!("{}/api/trigger", endpoint.trim_end_matches('/')))
                .json(&json!({
                    "prompt": item.message_text,
                    "request_id": item.request_id,
                    "source": item.source,
                    "sender": item.sender,
                }))
                .send()
                .await
                .map_err(|e| e.to_string())?;
            if !response.status().is_success() {
                return Err(format!("butler '{butler}' answered {}", response.status()));
            }
            Ok(())
        }
        .boxed()
    })
}

fn register_core_tools(
    tools: &Arc<ToolRegistry>,
    spawner: &Arc<Spawner>,
    module_states: &Arc<ModuleStateController>,
    config: &ButlerConfig,
    db: &Db,
) {
    tools.register_core_tool(
        "ping",
        "Liveness probe",
        json!({"type": "object", "properties": {}}),
        Arc::new(|_args| async { json!({"pong": true}) }.boxed()),
    );

    {
        let spawner = spawner.clone();
        tools.register_core_tool(
            "trigger",
            "Spawn a new runtime session on this butler",
            json!({
                "type": "object",
                "properties": {"prompt": {"type": "string"}},
                "required": ["prompt"]
            }),
            Arc::new(move |args| {
                let spawner = spawner.clone();
                async move {
                    let prompt = args.get("prompt").and_then(|v| v.as_str()).unwrap_or("");
                    match spawner.trigger(prompt, "trigger", None, None, None, None).await {
                        Ok(result) => json!({
                            "success": result.success,
                            "output": result.output,
                            "error": result.error,
                        }),
                        Err(e) => json!({"success": false, "error": e.to_string()}),
                    }
                }
                .boxed()
            }),
        );
    }

    {
        let module_states = module_states.clone();
        tools.register_core_tool(
            "module.set_enabled",
            "Enable or disable one of this butler's modules",
            json!({
                "type": "object",
                "properties": {
                    "module": {"type": "string"},
                    "enabled": {"type": "boolean"}
                },
                "required": ["module", "enabled"]
            }),
            Arc::new(move |args| {
                let module_states = module_states.clone();
                async move {
                    let module = args.get("module").and_then(|v| v.as_str()).unwrap_or("");
                    let enabled = args.get("enabled").and_then(|v| v.as_bool()).unwrap_or(true);
                    match module_states.set_module_enabled(module, enabled) {
                        Ok(state) => serde_json::to_value(state).unwrap_or(Value::Null),
                        Err(e) => json!({"error": e.to_string()}),
                    }
                }
                .boxed()
            }),
        );
    }

    if config.is_switchboard() {
        // The routing decision itself: the pipeline reads these calls out of
        // the classifier session's tool-call stream, so the handler only
        // acknowledges.
        tools.register_core_tool(
            "route_to_butler",
            "Route the current message to the named butler",
            json!({
                "type": "object",
                "properties": {"butler": {"type": "string"}},
                "required": ["butler"]
            }),
            Arc::new(|args| {
                async move {
                    json!({
                        "status": "ok",
                        "butler": args.get("butler").cloned().unwrap_or(Value::Null)
                    })
                }
                .boxed()
            }),
        );

        let heartbeat_db = db.clone();
        tools.register_core_tool(
            "connector.heartbeat",
            "Accept a connector liveness envelope",
            json!({"type": "object"}),
            Arc::new(move |args| {
                let db = heartbeat_db.clone();
                async move {
                    let connector_type = args
                        .pointer("/connector/connector_type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    info!(connector = %connector_type, "connector heartbeat received");
                    match butler_switchboard::catalog::record_heartbeat(
                        &db,
                        &format!("connector:{connector_type}"),
                    ) {
                        Ok(_) => json!({"status": "ok"}),
                        Err(e) => json!({"status": "error", "error": e.to_string()}),
                    }
                }
                .boxed()
            }),
        );
    }
}

/// Bridges the spawner's memory pre/post hooks to the local memory store.
struct StoreBackedHooks {
    store: Arc<MemoryStore>,
    butler: String,
}

impl MemoryHooks for StoreBackedHooks {
    fn fetch_context(&self, prompt: &str, token_budget: usize) -> Result<Option<String>, String> {
        memory_context(&self.store, prompt, &self.butler, token_budget).map_err(|e| e.to_string())
    }

    fn store_episode(&self, output: &str, session_id: Option<Uuid>) -> Result<(), String> {
        self.store
            .store_episode(output, &self.butler, session_id.map(|id| id.to_string()).as_deref())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// The built-in memory module: episodic + semantic recall tools over the
/// butler's own database.
struct MemoryModule;

#[async_trait]
impl Module for MemoryModule {
    fn name(&self) -> &str {
        "memory"
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "retrieval": {
                    "type": "object",
                    "properties": {
                        "context_token_budget": {"type": "integer"}
                    }
                }
            }
        })
    }

    fn migration_chain(&self) -> Option<butler_db::Chain> {
        Some(butler_memory::db::MEMORY_CHAIN)
    }

    fn register_tools(&self, registry: &ToolRegistry, _config: &Value, db: &Db) {
        let store = match MemoryStore::new(db.clone()) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!(error = %e, "memory store unavailable; memory tools not registered");
                return;
            }
        };

        {
            let store = store.clone();
            registry.register_module_tool(
                "memory",
                "memory_store_fact",
                "Store a subject/predicate fact, superseding any active fact with the same key",
                json!({
                    "type": "object",
                    "properties": {
                        "subject": {"type": "string"},
                        "predicate": {"type": "string"},
                        "content": {"type": "string"},
                        "scope": {"type": "string"},
                        "permanence": {"type": "string"}
                    },
                    "required": ["subject", "predicate", "content"]
                }),
                Arc::new(move |args| {
                    let store = store.clone();
                    async move {
                        let permanence = args
                            .get("permanence")
                            .and_then(|v| v.as_str())
                            .and_then(|s| s.parse::<Permanence>().ok())
                            .unwrap_or(Permanence::Standard);
                        let outcome = store.store_fact(
                            args.get("subject").and_then(|v| v.as_str()).unwrap_or(""),
                            args.get("predicate").and_then(|v| v.as_str()).unwrap_or(""),
                            args.get("content").and_then(|v| v.as_str()).unwrap_or(""),
                            args.get("scope").and_then(|v| v.as_str()).unwrap_or("global"),
                            permanence,
                        );
                        match outcome {
                            Ok(id) => json!({"id": id}),
                            Err(e) => json!({"error": e.to_string()}),
                        }
                    }
                    .boxed()
                }),
            );
        }

        {
            let store = store.clone();
            registry.register_module_tool(
                "memory",
                "memory_get",
                "Fetch a memory item by kind and id, bumping its reference count",
                json!({
                    "type": "object",
                    "properties": {
                        "kind": {"type": "string", "enum": ["episode", "fact", "rule"]},
                        "id": {"type": "string"}
                    },
                    "required": ["kind", "id"]
                }),
                Arc::new(move |args| {
                    let store = store.clone();
                    async move {
                        let kind = args
                            .get("kind")
                            .and_then(|v| v.as_str())
                            .and_then(|s| s.parse::<MemoryKind>().ok());
                        let id = args.get("id").and_then(|v| v.as_str()).unwrap_or("");
                        match kind {
                            Some(kind) => match store.get_memory(kind, id) {
                                Ok(Some(record)) => {
                                    serde_json::to_value(record).unwrap_or(Value::Null)
                                }
                                Ok(None) => Value::Null,
                                Err(e) => json!({"error": e.to_string()}),
                            },
                            None => json!({"error": "unknown memory kind"}),
                        }
                    }
                    .boxed()
                }),
            );
        }

        registry.register_module_tool(
            "memory",
            "memory_forget",
            "Soft-delete a memory item (episode expiry, fact retraction, rule flag)",
            json!({
                "type": "object",
                "properties": {
                    "kind": {"type": "string", "enum": ["episode", "fact", "rule"]},
                    "id": {"type": "string"}
                },
                "required": ["kind", "id"]
            }),
            Arc::new(move |args| {
                let store = store.clone();
                async move {
                    let kind = args
                        .get("kind")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse::<MemoryKind>().ok());
                    let id = args.get("id").and_then(|v| v.as_str()).unwrap_or("");
                    match kind {
                        Some(kind) => match store.forget_memory(kind, id) {
                            Ok(()) => json!({"status": "ok"}),
                            Err(e) => json!({"error": e.to_string()}),
                        },
                        None => json!({"error": "unknown memory kind"}),
                    }
                }
                .boxed()
            }),
        );
    }

    async fn on_startup(
        &self,
        _config: &Value,
        db: &Db,
        _credentials: Option<&CredentialStore>,
    ) -> butler_modules::Result<()> {
        // Schema is applied via migration_chain before startup; opening the
        // store here verifies the tables are usable.
        MemoryStore::new(db.clone())
            .map(|_| ())
            .map_err(|e| butler_modules::ModuleError::Config(e.to_string()))
    }
}
