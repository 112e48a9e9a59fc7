use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use butler_core::config::ButlerConfig;
use butler_db::Db;
use butler_sessions::SessionStore;
use butler_telemetry::{ButlerMetrics, TraceParent};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::AbortHandle;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::adapter::{Invocation, RuntimeAdapter, ToolCall, Usage};

/// Result of a spawner invocation.
#[derive(Debug, Clone, Default)]
pub struct SpawnerResult {
    pub output: Option<String>,
    pub success: bool,
    pub tool_calls: Vec<ToolCall>,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub model: String,
    pub session_id: Option<Uuid>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}

#[derive(Debug, Error)]
pub enum SpawnerError {
    #[error("Spawner is shutting down; not accepting new triggers")]
    ShuttingDown,
}

/// Memory pre/post hooks around a session. Failures are reported as strings
/// and must never fail the session itself.
pub trait MemoryHooks: Send + Sync {
    fn fetch_context(&self, prompt: &str, token_budget: usize) -> Result<Option<String>, String>;
    fn store_episode(&self, output: &str, session_id: Option<Uuid>) -> Result<(), String>;
}

/// Compose the runtime system prompt from base instructions and memory
/// context: when context exists it is appended after exactly one blank line.
fn compose_system_prompt(base: &str, memory_context: Option<&str>) -> String {
    match memory_context {
        Some(ctx) if !ctx.is_empty() => format!("{base}\n\n{ctx}"),
        _ => base.to_string(),
    }
}

struct InFlight {
    count: AtomicU64,
    empty: Notify,
}

/// RAII guard for gauge accounting; the decrement runs even when the owning
/// task is aborted mid-await.
struct GaugeGuard {
    metrics: ButlerMetrics,
    dec: fn(&ButlerMetrics),
    armed: bool,
}

impl GaugeGuard {
    fn new(metrics: &ButlerMetrics, inc: fn(&ButlerMetrics), dec: fn(&ButlerMetrics)) -> Self {
        inc(metrics);
        Self {
            metrics: metrics.clone(),
            dec,
            armed: true,
        }
    }

    fn release(&mut self) {
        if self.armed {
            (self.dec)(&self.metrics);
            self.armed = false;
        }
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Bounded-concurrency launcher of ephemeral runtime sessions.
///
/// Each butler has exactly one Spawner. A semaphore sized by
/// `runtime.max_concurrent_sessions` controls dispatch; with the default of 1
/// dispatch is strictly serial.
pub struct Spawner {
    config: ButlerConfig,
    config_dir: PathBuf,
    adapter: Arc<dyn RuntimeAdapter>,
    sessions: Option<Arc<SessionStore>>,
    audit_db: Option<Db>,
    memory: Option<Arc<dyn MemoryHooks>>,
    module_credentials_env: BTreeMap<String, Vec<String>>,
    metrics: ButlerMetrics,
    semaphore: Arc<Semaphore>,
    accepting: AtomicBool,
    in_flight: Arc<InFlight>,
    tasks: DashMap<u64, AbortHandle>,
    task_seq: AtomicU64,
}

impl Spawner {
    pub fn new(config: ButlerConfig, config_dir: PathBuf, adapter: Arc<dyn RuntimeAdapter>) -> Self {
        let slots = config.runtime.max_concurrent_sessions;
        let metrics = ButlerMetrics::new(&config.name);
        Self {
            config,
            config_dir,
            adapter,
            sessions: None,
            audit_db: None,
            memory: None,
            module_credentials_env: BTreeMap::new(),
            metrics,
            semaphore: Arc::new(Semaphore::new(slots)),
            accepting: AtomicBool::new(true),
            in_flight: Arc::new(InFlight {
                count: AtomicU64::new(0),
                empty: Notify::new(),
            }),
            tasks: DashMap::new(),
            task_seq: AtomicU64::new(0),
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Switchboard-owned pool for the central audit log.
    pub fn with_audit_db(mut self, db: Db) -> Self {
        self.audit_db = Some(db);
        self
    }

    pub fn with_memory_hooks(mut self, hooks: Arc<dyn MemoryHooks>) -> Self {
        self.memory = Some(hooks);
        self
    }

    /// Module name → env var names forwarded into runtime sessions.
    pub fn with_module_credentials(mut self, env: BTreeMap<String, Vec<String>>) -> Self {
        self.module_credentials_env = env;
        self
    }

    pub fn metrics(&self) -> &ButlerMetrics {
        &self.metrics
    }

    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Spawn an ephemeral runtime session.
    ///
    /// `trigger_source` is one of `tick`, `external`, `trigger`, or
    /// `schedule:<name>`. Self-trigger deadlock guard: a `trigger`-sourced
    /// call that finds every concurrency slot occupied is rejected
    /// immediately with a failed result — it never waits on the semaphore,
    /// so a session invoking its own trigger tool cannot deadlock.
    pub async fn trigger(
        self: &Arc<Self>,
        prompt: &str,
        trigger_source: &str,
        context: Option<&str>,
        max_turns: Option<u32>,
        parent_context: Option<TraceParent>,
        request_id: Option<&str>,
    ) -> Result<SpawnerResult, SpawnerError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SpawnerError::ShuttingDown);
        }

        if trigger_source == "trigger" && self.semaphore.available_permits() == 0 {
            let error_msg = "Runtime invocation rejected: trigger tool cannot be called while \
                             another session is in flight";
            warn!("{error_msg}");
            return Ok(SpawnerResult {
                success: false,
                error: Some(error_msg.to_string()),
                model: self.config.runtime.model.clone(),
                ..SpawnerResult::default()
            });
        }

        let this = self.clone();
        let prompt = prompt.to_string();
        let source = trigger_source.to_string();
        let context = context.map(str::to_string);
        let request_id = request_id.map(str::to_string);
        let max_turns = max_turns.unwrap_or(self.config.runtime.max_turns);

        let task = tokio::spawn(async move {
            this.run_once(prompt, source, context, max_turns, parent_context, request_id)
                .await
        });
        let key = self.task_seq.fetch_add(1, Ordering::Relaxed);
        self.tasks.insert(key, task.abort_handle());
        let outcome = task.await;
        self.tasks.remove(&key);

        match outcome {
            Ok(result) => Ok(result),
            Err(join_err) => {
                let error = if join_err.is_cancelled() {
                    "Runtime session cancelled during shutdown".to_string()
                } else {
                    format!("Runtime session task failed: {join_err}")
                };
                Ok(SpawnerResult {
                    success: false,
                    error: Some(error),
                    model: self.config.runtime.model.clone(),
                    ..SpawnerResult::default()
                })
            }
        }
    }

    /// Stop accepting new trigger requests. In-flight sessions continue
    /// until they complete or `drain` cancels them.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
        info!("spawner stopped accepting new triggers");
    }

    /// Wait for in-flight sessions, cancelling stragglers after `timeout`.
    pub async fn drain(&self, timeout: Duration) {
        if self.in_flight_count() == 0 {
            info!("no in-flight sessions to drain");
            return;
        }
        info!(
            in_flight = self.in_flight_count(),
            timeout_s = timeout.as_secs(),
            "draining in-flight sessions"
        );

        let deadline = Instant::now() + timeout;
        loop {
            if self.in_flight_count() == 0 {
                info!("all in-flight sessions drained");
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let notified = self.in_flight.empty.notified();
            if tokio::time::timeout(remaining, notified).await.is_err() {
                break;
            }
        }

        let cancelled = self.tasks.len();
        warn!(cancelled, "drain timeout; cancelling in-flight sessions");
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
        // Give aborted tasks a beat to run their guards.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn run_once(
        self: Arc<Self>,
        prompt: String,
        trigger_source: String,
        context: Option<String>,
        max_turns: u32,
        parent_context: Option<TraceParent>,
        request_id: Option<String>,
    ) -> SpawnerResult {
        struct FlightGuard(Arc<InFlight>);
        impl Drop for FlightGuard {
            fn drop(&mut self) {
                if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.0.empty.notify_waiters();
                }
            }
        }
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        let _flight = FlightGuard(self.in_flight.clone());

        let mut queued = GaugeGuard::new(
            &self.metrics,
            ButlerMetrics::spawner_queued_triggers_inc,
            ButlerMetrics::spawner_queued_triggers_dec,
        );
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("session semaphore is never closed");
        queued.release();
        let _active = GaugeGuard::new(
            &self.metrics,
            ButlerMetrics::spawner_active_sessions_inc,
            ButlerMetrics::spawner_active_sessions_dec,
        );

        let final_prompt = match context {
            Some(ref ctx) if !ctx.is_empty() => format!("{ctx}\n\n{prompt}"),
            _ => prompt,
        };

        let trace = parent_context
            .map(|p| p.child())
            .unwrap_or_else(TraceParent::new_root);
        let span = info_span!(
            "butler.llm_session",
            butler.name = %self.config.name,
            trace_id = %trace.trace_id,
            prompt_length = final_prompt.len(),
            trigger_source = %trigger_source,
        );

        let t0 = Instant::now();
        let result = self
            .clone()
            .invoke_session(final_prompt, &trigger_source, max_turns, &trace, request_id)
            .instrument(span)
            .await;
        self.metrics
            .record_session_duration(t0.elapsed().as_millis() as u64);
        result
    }

    async fn invoke_session(
        self: Arc<Self>,
        final_prompt: String,
        trigger_source: &str,
        max_turns: u32,
        trace: &TraceParent,
        request_id: Option<String>,
    ) -> SpawnerResult {
        let model = self.config.runtime.model.clone();
        let t0 = Instant::now();

        let session_id = match &self.sessions {
            Some(store) => match store.session_create(
                &final_prompt,
                trigger_source,
                Some(&trace.trace_id),
                &model,
                request_id.as_deref(),
            ) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(error = %e, "session row creation failed; continuing unlogged");
                    None
                }
            },
            None => None,
        };

        let invocation_outcome = async {
            let base_prompt = self
                .adapter
                .parse_system_prompt_file(&self.config_dir)
                .map_err(|e| format!("system prompt unreadable: {e}"))?;

            let memory_ctx = if self.config.memory_enabled() {
                self.memory.as_ref().and_then(|hooks| {
                    hooks
                        .fetch_context(&final_prompt, self.config.memory_context_token_budget())
                        .unwrap_or_else(|e| {
                            warn!(error = %e, "memory context fetch failed (ignored)");
                            None
                        })
                })
            } else {
                None
            };
            let system_prompt = compose_system_prompt(&base_prompt, memory_ctx.as_deref());

            let mut mcp_servers = BTreeMap::new();
            mcp_servers.insert(
                self.config.name.clone(),
                format!("http://localhost:{}/sse", self.config.port),
            );

            let invocation = Invocation {
                prompt: final_prompt.clone(),
                system_prompt,
                mcp_servers,
                env: self.build_env(trace),
                max_turns,
                model: Some(model.clone()),
                cwd: Some(self.config_dir.clone()),
                timeout: Some(Duration::from_secs(self.config.runtime.session_timeout_s)),
            };

            // A fresh worker per session: adapters share only static config,
            // so concurrent sessions can never cross-talk through one.
            let worker = self.adapter.create_worker();
            worker.invoke(invocation).await.map_err(|e| e.to_string())
        }
        .await;

        let duration_ms = t0.elapsed().as_millis() as i64;
        match invocation_outcome {
            Ok((output, tool_calls, usage)) => {
                let usage = usage.unwrap_or(Usage::default());
                let result = SpawnerResult {
                    output: output.clone(),
                    success: true,
                    tool_calls: tool_calls.clone(),
                    error: None,
                    duration_ms,
                    model: model.clone(),
                    session_id,
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                };

                if let (Some(store), Some(id)) = (&self.sessions, session_id) {
                    let calls = serde_json::to_value(&tool_calls).unwrap_or_default();
                    if let Err(e) = store.session_complete(
                        id,
                        output.as_deref(),
                        &calls,
                        duration_ms,
                        true,
                        None,
                        usage.input_tokens,
                        usage.output_tokens,
                    ) {
                        warn!(error = %e, "session completion write failed");
                    }
                }

                butler_sessions::write_audit_entry(
                    self.audit_db.as_ref(),
                    &self.config.name,
                    "session",
                    &serde_json::json!({
                        "session_id": session_id.map(|id| id.to_string()),
                        "trigger_source": trigger_source,
                        "prompt": prompt_excerpt(&final_prompt),
                        "duration_ms": duration_ms,
                        "tool_calls_count": tool_calls.len(),
                        "model": model,
                        "input_tokens": usage.input_tokens,
                        "output_tokens": usage.output_tokens,
                    }),
                    "ok",
                    None,
                );

                if self.config.memory_enabled() {
                    if let (Some(hooks), Some(ref text)) = (&self.memory, &result.output) {
                        if !text.is_empty() {
                            if let Err(e) = hooks.store_episode(text, session_id) {
                                warn!(error = %e, "episode store failed (ignored)");
                            }
                        }
                    }
                }
                result
            }
            Err(error_msg) => {
                tracing::error!(error = %error_msg, "runtime invocation failed");
                if let (Some(store), Some(id)) = (&self.sessions, session_id) {
                    if let Err(e) = store.session_complete(
                        id,
                        None,
                        &serde_json::json!([]),
                        duration_ms,
                        false,
                        Some(&error_msg),
                        None,
                        None,
                    ) {
                        warn!(error = %e, "failed-session write failed");
                    }
                }
                butler_sessions::write_audit_entry(
                    self.audit_db.as_ref(),
                    &self.config.name,
                    "session",
                    &serde_json::json!({
                        "session_id": session_id.map(|id| id.to_string()),
                        "trigger_source": trigger_source,
                        "prompt": prompt_excerpt(&final_prompt),
                        "duration_ms": duration_ms,
                    }),
                    "error",
                    Some(&error_msg),
                );
                SpawnerResult {
                    output: None,
                    success: false,
                    tool_calls: Vec::new(),
                    error: Some(error_msg),
                    duration_ms,
                    model,
                    session_id,
                    input_tokens: None,
                    output_tokens: None,
                }
            }
        }
    }

    /// Explicit env for the runtime subprocess: only declared variables,
    /// provider API keys (the adapter filters foreign ones), and the
    /// traceparent for distributed tracing.
    fn build_env(&self, trace: &TraceParent) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for key in ["ANTHROPIC_API_KEY", "GEMINI_API_KEY", "GOOGLE_API_KEY"] {
            if let Ok(value) = std::env::var(key) {
                if !value.is_empty() {
                    env.insert(key.to_string(), value);
                }
            }
        }
        for var in self.config.env_required.iter().chain(&self.config.env_optional) {
            if let Ok(value) = std::env::var(var) {
                env.insert(var.clone(), value);
            }
        }
        for vars in self.module_credentials_env.values() {
            for var in vars {
                if let Ok(value) = std::env::var(var) {
                    env.insert(var.clone(), value);
                }
            }
        }
        let (key, value) = trace.env_pair();
        env.insert(key, value);
        env
    }
}

fn prompt_excerpt(prompt: &str) -> String {
    let mut end = prompt.len().min(200);
    while !prompt.is_char_boundary(end) {
        end -= 1;
    }
    prompt[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterError;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    struct MockAdapter {
        delay: Duration,
        fail: bool,
        last_invocation: Arc<Mutex<Option<Invocation>>>,
    }

    impl MockAdapter {
        fn instant() -> Self {
            Self {
                delay: Duration::ZERO,
                fail: false,
                last_invocation: Arc::new(Mutex::new(None)),
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                fail: false,
                last_invocation: Arc::new(Mutex::new(None)),
            }
        }
    }

    #[async_trait]
    impl RuntimeAdapter for MockAdapter {
        fn name(&self) -> &str {
            "mock"
        }
        fn parse_system_prompt_file(&self, _config_dir: &Path) -> std::io::Result<String> {
            Ok("base prompt".to_string())
        }
        fn build_config_file(
            &self,
            _mcp_servers: &BTreeMap<String, String>,
            tmp_dir: &Path,
        ) -> std::io::Result<std::path::PathBuf> {
            Ok(tmp_dir.join("mock.json"))
        }
        async fn invoke(
            &self,
            invocation: Invocation,
        ) -> Result<(Option<String>, Vec<ToolCall>, Option<Usage>), AdapterError> {
            *self.last_invocation.lock().unwrap() = Some(invocation);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(AdapterError::Unavailable("mock failure".into()));
            }
            Ok((
                Some("mock output".to_string()),
                vec![],
                Some(Usage {
                    input_tokens: Some(10),
                    output_tokens: Some(5),
                }),
            ))
        }
        fn create_worker(&self) -> Box<dyn RuntimeAdapter> {
            Box::new(Self {
                delay: self.delay,
                fail: self.fail,
                last_invocation: self.last_invocation.clone(),
            })
        }
    }

    fn test_config(max_concurrent: usize) -> ButlerConfig {
        let toml = format!(
            r#"
                name = "general"
                port = 8201
                [runtime]
                max_concurrent_sessions = {max_concurrent}
            "#
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("butler.toml");
        std::fs::write(&path, toml).unwrap();
        ButlerConfig::load(path.to_str().unwrap()).unwrap()
    }

    fn spawner_with(adapter: MockAdapter, max_concurrent: usize) -> Arc<Spawner> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(Spawner::new(
            test_config(max_concurrent),
            dir.path().to_path_buf(),
            Arc::new(adapter),
        ))
    }

    #[tokio::test]
    async fn successful_trigger_returns_output_and_usage() {
        let spawner = spawner_with(MockAdapter::instant(), 1);
        let result = spawner
            .trigger("hello", "external", None, None, None, None)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some("mock output"));
        assert_eq!(result.input_tokens, Some(10));
        assert_eq!(spawner.metrics().active_sessions(), 0);
        assert_eq!(spawner.metrics().queued_triggers(), 0);
        assert_eq!(spawner.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn self_trigger_is_rejected_when_all_slots_taken() {
        let spawner = spawner_with(MockAdapter::slow(Duration::from_millis(500)), 1);

        let outer = {
            let spawner = spawner.clone();
            tokio::spawn(async move {
                spawner
                    .trigger("long outer session", "external", None, None, None, None)
                    .await
                    .unwrap()
            })
        };
        // Let the outer session take the only slot.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let t0 = Instant::now();
        let nested = spawner
            .trigger("nested self trigger", "trigger", None, None, None, None)
            .await
            .unwrap();
        assert!(!nested.success);
        assert!(nested.error.as_deref().unwrap().contains("rejected"));
        // The guard must reject immediately, never block on the semaphore.
        assert!(t0.elapsed() < Duration::from_millis(200));

        let outer_result = outer.await.unwrap();
        assert!(outer_result.success);
    }

    #[tokio::test]
    async fn trigger_source_trigger_runs_when_a_slot_is_free() {
        let spawner = spawner_with(MockAdapter::instant(), 2);
        let result = spawner
            .trigger("self trigger with room", "trigger", None, None, None, None)
            .await
            .unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn stop_accepting_fails_new_triggers() {
        let spawner = spawner_with(MockAdapter::instant(), 1);
        spawner.stop_accepting();
        assert!(matches!(
            spawner.trigger("late", "external", None, None, None, None).await,
            Err(SpawnerError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn drain_cancels_stragglers_and_accounting_balances() {
        let spawner = spawner_with(MockAdapter::slow(Duration::from_secs(30)), 1);
        let task = {
            let spawner = spawner.clone();
            tokio::spawn(async move {
                spawner
                    .trigger("stuck session", "external", None, None, None, None)
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(spawner.in_flight_count(), 1);

        spawner.stop_accepting();
        spawner.drain(Duration::from_millis(150)).await;

        let result = task.await.unwrap();
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("cancelled"));
        assert_eq!(spawner.in_flight_count(), 0);
        assert_eq!(spawner.metrics().active_sessions(), 0);
        assert_eq!(spawner.metrics().queued_triggers(), 0);
    }

    #[tokio::test]
    async fn adapter_failure_produces_failed_result() {
        let adapter = MockAdapter {
            delay: Duration::ZERO,
            fail: true,
            last_invocation: Arc::new(Mutex::new(None)),
        };
        let spawner = spawner_with(adapter, 1);
        let result = spawner
            .trigger("will fail", "external", None, None, None, None)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("mock failure"));
        assert_eq!(spawner.metrics().active_sessions(), 0);
    }

    #[tokio::test]
    async fn context_is_prepended_with_blank_line() {
        let adapter = MockAdapter::instant();
        let captured = adapter.last_invocation.clone();
        let spawner = spawner_with(adapter, 1);
        spawner
            .trigger("current message", "external", Some("routing context"), None, None, None)
            .await
            .unwrap();
        let invocation = captured.lock().unwrap().clone().unwrap();
        assert_eq!(invocation.prompt, "routing context\n\ncurrent message");
    }

    #[test]
    fn system_prompt_composition_uses_exactly_one_blank_line() {
        assert_eq!(compose_system_prompt("base", None), "base");
        assert_eq!(compose_system_prompt("base", Some("")), "base");
        assert_eq!(compose_system_prompt("base", Some("ctx")), "base\n\nctx");
    }

    #[tokio::test]
    async fn mcp_servers_are_locked_to_this_butler() {
        let adapter = MockAdapter::instant();
        let captured = adapter.last_invocation.clone();
        let spawner = spawner_with(adapter, 1);
        spawner
            .trigger("check mcp", "external", None, None, None, None)
            .await
            .unwrap();
        let invocation = captured.lock().unwrap().clone().unwrap();
        assert_eq!(invocation.mcp_servers.len(), 1);
        assert_eq!(
            invocation.mcp_servers.get("general").unwrap(),
            "http://localhost:8201/sse"
        );
        assert!(invocation.env.contains_key("traceparent"));
    }

    struct FailingHooks;
    impl MemoryHooks for FailingHooks {
        fn fetch_context(&self, _prompt: &str, _budget: usize) -> Result<Option<String>, String> {
            Err("memory db exploded".to_string())
        }
        fn store_episode(&self, _output: &str, _session_id: Option<Uuid>) -> Result<(), String> {
            Err("memory db exploded".to_string())
        }
    }

    #[tokio::test]
    async fn memory_hook_failures_never_fail_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let toml = r#"
            name = "general"
            port = 8201
            [modules.memory.retrieval]
            context_token_budget = 1000
        "#;
        let path = dir.path().join("butler.toml");
        std::fs::write(&path, toml).unwrap();
        let config = ButlerConfig::load(path.to_str().unwrap()).unwrap();

        let spawner = Arc::new(
            Spawner::new(config, dir.path().to_path_buf(), Arc::new(MockAdapter::instant()))
                .with_memory_hooks(Arc::new(FailingHooks)),
        );
        let result = spawner
            .trigger("hello", "external", None, None, None, None)
            .await
            .unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn trace_parent_is_propagated_as_child() {
        let adapter = MockAdapter::instant();
        let captured = adapter.last_invocation.clone();
        let spawner = spawner_with(adapter, 1);
        let parent = TraceParent::new_root();
        spawner
            .trigger("traced", "external", None, None, Some(parent.clone()), None)
            .await
            .unwrap();
        let invocation = captured.lock().unwrap().clone().unwrap();
        let sent = TraceParent::parse(invocation.env.get("traceparent").unwrap()).unwrap();
        assert_eq!(sent.trace_id, parent.trace_id);
        assert_ne!(sent.span_id, parent.span_id);
    }
}
