use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A tool call normalised out of the CLI event stream.
/// Claude emits `tool_use` blocks, Gemini emits `functionCall` events; both
/// collapse to this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}

/// Everything an adapter needs for one subprocess run.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub prompt: String,
    pub system_prompt: String,
    /// MCP server name → URL mapping written into the CLI config file.
    pub mcp_servers: BTreeMap<String, String>,
    /// The complete subprocess environment. Nothing else leaks through.
    pub env: BTreeMap<String, String>,
    pub max_turns: u32,
    pub model: Option<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("runtime CLI unavailable: {0}")]
    Unavailable(String),

    #[error("runtime CLI exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("failed to parse runtime output: {0}")]
    Parse(String),

    #[error("runtime invocation timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract invocation of an external LLM CLI.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Adapter name for logging ("claude-cli", "gemini-cli").
    fn name(&self) -> &str;

    /// Read the adapter-specific system prompt file from the butler's config
    /// directory. Each adapter decides its own file priority and never reads
    /// another adapter's file.
    fn parse_system_prompt_file(&self, config_dir: &Path) -> std::io::Result<String>;

    /// Write the MCP server mapping the CLI will load; returns the file path.
    fn build_config_file(
        &self,
        mcp_servers: &BTreeMap<String, String>,
        tmp_dir: &Path,
    ) -> std::io::Result<PathBuf>;

    /// Spawn the subprocess and stream-parse its per-line events.
    ///
    /// Returns at most one result text, all tool calls in emission order, and
    /// token usage when the CLI reports it. Cancellation (dropping the future)
    /// kills the subprocess.
    async fn invoke(
        &self,
        invocation: Invocation,
    ) -> Result<(Option<String>, Vec<ToolCall>, Option<Usage>), AdapterError>;

    /// An independent instance sharing only static config, so concurrent
    /// sessions never share mutable adapter state.
    fn create_worker(&self) -> Box<dyn RuntimeAdapter>;
}

/// Truncate a stderr excerpt for error messages.
pub(crate) fn stderr_excerpt(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.len() <= 500 {
        trimmed.to_string()
    } else {
        let mut end = 500;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}
