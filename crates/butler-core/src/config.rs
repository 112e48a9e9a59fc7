use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{ButlerError, Result};

pub const DEFAULT_SWITCHBOARD_URL: &str = "http://localhost:8200";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-6";
/// Liveness reporter cadence (seconds) when butler.toml does not override it.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 120;

/// Top-level per-butler config (butler.toml + BUTLER_* env overrides).
///
/// Every butler daemon loads exactly one of these; the switchboard is just a
/// butler whose `name` is "switchboard" and which carries the `[buffer]` and
/// `[routing]` sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButlerConfig {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default = "default_switchboard_url")]
    pub switchboard_url: String,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Env vars the daemon refuses to start without.
    #[serde(default)]
    pub env_required: Vec<String>,
    /// Env vars forwarded to runtime sessions when present.
    #[serde(default)]
    pub env_optional: Vec<String>,
    /// Opaque per-module config tables. A module is enabled iff its name is a
    /// key here; the value is validated against the module's config schema.
    #[serde(default)]
    pub modules: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Which CLI adapter spawns sessions: "claude" or "gemini".
    #[serde(default = "default_adapter")]
    pub adapter: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_sessions: usize,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Hard wall-clock cap for a single runtime invocation.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_s: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            adapter: default_adapter(),
            model: default_model(),
            max_concurrent_sessions: default_max_concurrent(),
            max_turns: default_max_turns(),
            session_timeout_s: default_session_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Seconds to wait for in-flight sessions before cancelling them.
    #[serde(default = "default_shutdown_timeout")]
    pub timeout_s: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_s: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DbConfig {
    /// Path to this butler's own SQLite database.
    /// Defaults to `~/.butlers/<name>.db` when unset.
    pub path: Option<String>,
    /// Path to the shared credential database (`BUTLER_DB_SHARED_PATH`).
    pub shared_path: Option<String>,
    /// Path to the legacy shared database consulted after `shared_path`.
    pub legacy_shared_path: Option<String>,
}

impl DbConfig {
    /// Resolve the butler's own DB path, deriving the default from its name.
    pub fn path_for(&self, butler_name: &str) -> String {
        self.path.clone().unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            format!("{home}/.butlers/{butler_name}.db")
        })
    }

    pub fn shared_path(&self) -> String {
        self.shared_path.clone().unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            format!("{home}/.butlers/butler_shared.db")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_seconds: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_heartbeat_interval(),
        }
    }
}

/// Durable buffer tuning. Only meaningful on the switchboard but harmless
/// elsewhere — every butler can host a buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_scanner_interval")]
    pub scanner_interval_s: u64,
    #[serde(default = "default_scanner_grace")]
    pub scanner_grace_s: u64,
    #[serde(default = "default_scanner_batch")]
    pub scanner_batch_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring_capacity(),
            worker_count: default_worker_count(),
            scanner_interval_s: default_scanner_interval(),
            scanner_grace_s: default_scanner_grace(),
            scanner_batch_size: default_scanner_batch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Destination when the classifier emits no `route_to_butler` call.
    #[serde(default = "default_fallback_butler")]
    pub fallback_butler: String,
    /// Days an ingress-dedupe entry stays authoritative.
    #[serde(default = "default_ingress_retention_days")]
    pub ingress_dedupe_retention_days: u32,
    #[serde(default)]
    pub history: HistoryConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            fallback_butler: default_fallback_butler(),
            ingress_dedupe_retention_days: default_ingress_retention_days(),
            history: HistoryConfig::default(),
        }
    }
}

/// Conversation-history windowing knobs (realtime + email strategies).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_window_minutes")]
    pub max_time_window_minutes: i64,
    #[serde(default = "default_history_message_count")]
    pub max_message_count: usize,
    /// Token budget for the realtime union window.
    #[serde(default = "default_history_max_tokens")]
    pub max_tokens: usize,
    /// Token budget for the email full-chain strategy.
    #[serde(default = "default_email_max_tokens")]
    pub email_max_tokens: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_time_window_minutes: default_history_window_minutes(),
            max_message_count: default_history_message_count(),
            max_tokens: default_history_max_tokens(),
            email_max_tokens: default_email_max_tokens(),
        }
    }
}

/// When and how often a scheduled prompt fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Run exactly once at the given UTC instant.
    Once { at: chrono::DateTime<chrono::Utc> },
    /// Run repeatedly with a fixed interval in seconds.
    Interval { every_secs: u64 },
    /// Run every day at the given hour and minute (UTC).
    Daily { hour: u8, minute: u8 },
    /// Run on a specific weekday (0 = Monday … 6 = Sunday) at the given time (UTC).
    Weekly { day: u8, hour: u8, minute: u8 },
}

/// One `[[schedules]]` entry from butler.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    pub schedule: ScheduleSpec,
    /// Prompt handed to the spawner with trigger_source = "schedule:<name>".
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub log_root: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_root: None,
        }
    }
}

impl ButlerConfig {
    /// Load config from a TOML file with BUTLER_* env var overrides.
    pub fn load(path: &str) -> Result<Self> {
        let config: ButlerConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("BUTLER_").split("__"))
            .extract()
            .map_err(|e| ButlerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks figment cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ButlerError::Validation("butler name must not be empty".into()));
        }
        if self.heartbeat.interval_seconds == 0 {
            return Err(ButlerError::Validation(
                "heartbeat.interval_seconds must be positive".into(),
            ));
        }
        if self.runtime.max_concurrent_sessions == 0 {
            return Err(ButlerError::Validation(
                "runtime.max_concurrent_sessions must be positive".into(),
            ));
        }
        match self.runtime.adapter.as_str() {
            "claude" | "gemini" => {}
            other => {
                return Err(ButlerError::Validation(format!(
                    "unknown runtime adapter '{other}' (expected claude or gemini)"
                )))
            }
        }
        Ok(())
    }

    /// Whether the memory module is enabled for this butler.
    pub fn memory_enabled(&self) -> bool {
        self.modules.get("memory").is_some_and(|v| v.is_object())
    }

    /// `memory.retrieval.context_token_budget`, defaulting to 3000.
    /// Non-positive or malformed values fall back to the default.
    pub fn memory_context_token_budget(&self) -> usize {
        let budget = self
            .modules
            .get("memory")
            .and_then(|m| m.get("retrieval"))
            .and_then(|r| r.get("context_token_budget"))
            .and_then(|b| b.as_i64())
            .unwrap_or(3000);
        if budget > 0 {
            budget as usize
        } else {
            3000
        }
    }

    pub fn is_switchboard(&self) -> bool {
        self.name == "switchboard"
    }
}

fn default_switchboard_url() -> String {
    std::env::var("BUTLERS_SWITCHBOARD_URL")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_SWITCHBOARD_URL.to_string())
}
fn default_adapter() -> String {
    "claude".to_string()
}
fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}
fn default_max_concurrent() -> usize {
    1
}
fn default_max_turns() -> u32 {
    20
}
fn default_session_timeout() -> u64 {
    600
}
fn default_shutdown_timeout() -> u64 {
    30
}
fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}
fn default_ring_capacity() -> usize {
    256
}
fn default_worker_count() -> usize {
    2
}
fn default_scanner_interval() -> u64 {
    30
}
fn default_scanner_grace() -> u64 {
    60
}
fn default_scanner_batch() -> usize {
    50
}
fn default_fallback_butler() -> String {
    "general".to_string()
}
fn default_ingress_retention_days() -> u32 {
    7
}
fn default_history_window_minutes() -> i64 {
    15
}
fn default_history_message_count() -> usize {
    30
}
fn default_history_max_tokens() -> usize {
    50_000
}
fn default_email_max_tokens() -> usize {
    8_000
}
fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            name = "health"
            port = 8211
            description = "Health butler"

            [runtime]
            model = "claude-haiku-4-5"

            [modules.memory.retrieval]
            context_token_budget = 2500

            [[schedules]]
            name = "morning-brief"
            prompt = "Summarise overnight messages."
            schedule = { kind = "daily", hour = 7, minute = 30 }
        "#
    }

    #[test]
    fn loads_minimal_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("butler.toml");
        std::fs::write(&path, minimal_toml()).unwrap();

        let config = ButlerConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.name, "health");
        assert_eq!(config.port, 8211);
        assert_eq!(config.runtime.model, "claude-haiku-4-5");
        assert_eq!(config.runtime.max_concurrent_sessions, 1);
        assert_eq!(config.shutdown.timeout_s, 30);
        assert!(config.memory_enabled());
        assert_eq!(config.memory_context_token_budget(), 2500);
        assert_eq!(config.schedules.len(), 1);
        assert!(!config.is_switchboard());
    }

    #[test]
    fn memory_budget_falls_back_when_missing_or_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("butler.toml");
        std::fs::write(
            &path,
            r#"
                name = "general"
                port = 8201
                [modules.memory.retrieval]
                context_token_budget = -5
            "#,
        )
        .unwrap();
        let config = ButlerConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.memory_context_token_budget(), 3000);
    }

    #[test]
    fn zero_heartbeat_interval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("butler.toml");
        std::fs::write(
            &path,
            r#"
                name = "general"
                port = 8201
                [heartbeat]
                interval_seconds = 0
            "#,
        )
        .unwrap();
        let err = ButlerConfig::load(path.to_str().unwrap()).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn unknown_adapter_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("butler.toml");
        std::fs::write(
            &path,
            r#"
                name = "general"
                port = 8201
                [runtime]
                adapter = "cortex"
            "#,
        )
        .unwrap();
        assert!(ButlerConfig::load(path.to_str().unwrap()).is_err());
    }
}
