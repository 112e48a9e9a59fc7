use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::adapter::{
    stderr_excerpt, AdapterError, Invocation, RuntimeAdapter, ToolCall, Usage,
};

/// Env vars that belong to other runtimes and must not reach this one.
const FOREIGN_ENV: &[&str] = &["GEMINI_API_KEY", "GOOGLE_API_KEY"];

/// Runtime adapter that delegates to the Claude Code CLI (`claude -p`).
///
/// Tool calls surface as `tool_use` content blocks in the stream-json event
/// feed; butler tools are exposed to the CLI through the MCP config file.
pub struct ClaudeCliAdapter {
    command: String,
    /// Tools allowed in pipe mode. Empty = no `--allowedTools` flag.
    allowed_tools: Vec<String>,
}

impl ClaudeCliAdapter {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            allowed_tools: Vec::new(),
        }
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = tools;
        self
    }
}

#[async_trait]
impl RuntimeAdapter for ClaudeCliAdapter {
    fn name(&self) -> &str {
        "claude-cli"
    }

    /// Claude sessions read `CLAUDE.md`. A missing file is an empty prompt,
    /// not an error — new butlers start without one.
    fn parse_system_prompt_file(&self, config_dir: &Path) -> std::io::Result<String> {
        let path = config_dir.join("CLAUDE.md");
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    fn build_config_file(
        &self,
        mcp_servers: &BTreeMap<String, String>,
        tmp_dir: &Path,
    ) -> std::io::Result<PathBuf> {
        let servers: serde_json::Map<String, serde_json::Value> = mcp_servers
            .iter()
            .map(|(name, url)| {
                (
                    name.clone(),
                    serde_json::json!({ "type": "sse", "url": url }),
                )
            })
            .collect();
        let config = serde_json::json!({ "mcpServers": servers });
        let path = tmp_dir.join("mcp-config.json");
        std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;
        Ok(path)
    }

    async fn invoke(
        &self,
        invocation: Invocation,
    ) -> Result<(Option<String>, Vec<ToolCall>, Option<Usage>), AdapterError> {
        let tmp = tempfile::Builder::new()
            .prefix("butler-claude-")
            .tempdir()
            .map_err(|e| AdapterError::Unavailable(format!("failed to create temp dir: {e}")))?;

        let sys_path = tmp.path().join("system-prompt.md");
        std::fs::write(&sys_path, &invocation.system_prompt)?;
        let mcp_path = self.build_config_file(&invocation.mcp_servers, tmp.path())?;

        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--max-turns")
            .arg(invocation.max_turns.to_string())
            .arg("--system-prompt-file")
            .arg(&sys_path)
            .arg("--mcp-config")
            .arg(&mcp_path)
            .arg("--no-session-persistence")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .kill_on_drop(true);

        if let Some(ref model) = invocation.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(ref cwd) = invocation.cwd {
            cmd.current_dir(cwd);
        }
        for tool in &self.allowed_tools {
            cmd.arg("--allowedTools").arg(tool);
        }
        for (key, value) in &invocation.env {
            if FOREIGN_ENV.contains(&key.as_str()) {
                continue;
            }
            cmd.env(key, value);
        }

        debug!(
            command = %self.command,
            prompt_len = invocation.prompt.len(),
            system_len = invocation.system_prompt.len(),
            "spawning claude CLI"
        );

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AdapterError::Unavailable(format!(
                    "claude CLI not found at '{}' — install Claude Code first",
                    self.command
                ))
            } else {
                AdapterError::Unavailable(format!("failed to spawn claude CLI: {e}"))
            }
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(invocation.prompt.as_bytes()).await?;
            drop(stdin);
        }

        let run = drive_child(&mut child);
        let outcome = match invocation.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(res) => res,
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(AdapterError::Timeout(limit));
                }
            },
            None => run.await,
        };
        outcome
    }

    fn create_worker(&self) -> Box<dyn RuntimeAdapter> {
        Box::new(Self {
            command: self.command.clone(),
            allowed_tools: self.allowed_tools.clone(),
        })
    }
}

/// Read stdout line-by-line, folding events; collect stderr for diagnostics.
async fn drive_child(
    child: &mut tokio::process::Child,
) -> Result<(Option<String>, Vec<ToolCall>, Option<Usage>), AdapterError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AdapterError::Unavailable("claude stdout not captured".into()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| AdapterError::Unavailable("claude stderr not captured".into()))?;

    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let mut lines = BufReader::new(stdout).lines();
    let mut result_text: Option<String> = None;
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut usage: Option<Usage> = None;

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "skipping unparseable claude event line");
                continue;
            }
        };
        fold_event(&event, &mut result_text, &mut tool_calls, &mut usage);
    }

    let status = child.wait().await?;
    let stderr_buf = stderr_task.await.unwrap_or_default();

    if !status.success() {
        return Err(AdapterError::NonZeroExit {
            code: status.code().unwrap_or(1),
            stderr: stderr_excerpt(&stderr_buf),
        });
    }
    Ok((result_text, tool_calls, usage))
}

/// Fold one stream-json event into the accumulated invocation outcome.
fn fold_event(
    event: &serde_json::Value,
    result_text: &mut Option<String>,
    tool_calls: &mut Vec<ToolCall>,
    usage: &mut Option<Usage>,
) {
    match event.get("type").and_then(|t| t.as_str()) {
        Some("assistant") => {
            let blocks = event
                .pointer("/message/content")
                .and_then(|c| c.as_array())
                .cloned()
                .unwrap_or_default();
            for block in blocks {
                if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                    tool_calls.push(ToolCall {
                        id: block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        name: block.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        input: block.get("input").cloned().unwrap_or(serde_json::json!({})),
                    });
                }
            }
        }
        Some("result") => {
            // At most one result event; the last one wins if the CLI
            // ever emits more.
            *result_text = event
                .get("result")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let input = event.pointer("/usage/input_tokens").and_then(|v| v.as_i64());
            let output = event.pointer("/usage/output_tokens").and_then(|v| v.as_i64());
            if input.is_some() || output.is_some() {
                *usage = Some(Usage {
                    input_tokens: input,
                    output_tokens: output,
                });
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_system_prompt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ClaudeCliAdapter::new("claude");
        assert_eq!(adapter.parse_system_prompt_file(dir.path()).unwrap(), "");
    }

    #[test]
    fn reads_claude_md_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("CLAUDE.md"), "You are the health butler.").unwrap();
        std::fs::write(dir.path().join("GEMINI.md"), "WRONG FILE").unwrap();
        let adapter = ClaudeCliAdapter::new("claude");
        let prompt = adapter.parse_system_prompt_file(dir.path()).unwrap();
        assert_eq!(prompt, "You are the health butler.");
    }

    #[test]
    fn config_file_maps_servers_to_sse_entries() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ClaudeCliAdapter::new("claude");
        let mut servers = BTreeMap::new();
        servers.insert("health".to_string(), "http://localhost:8211/sse".to_string());
        let path = adapter.build_config_file(&servers, dir.path()).unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written["mcpServers"]["health"]["url"], "http://localhost:8211/sse");
        assert_eq!(written["mcpServers"]["health"]["type"], "sse");
    }

    #[test]
    fn fold_event_collects_tool_calls_and_result() {
        let mut result = None;
        let mut calls = Vec::new();
        let mut usage = None;

        fold_event(
            &json!({"type": "assistant", "message": {"content": [
                {"type": "text", "text": "thinking"},
                {"type": "tool_use", "id": "tu_1", "name": "contacts_list", "input": {"q": "anna"}}
            ]}}),
            &mut result,
            &mut calls,
            &mut usage,
        );
        fold_event(
            &json!({"type": "result", "result": "All done.",
                    "usage": {"input_tokens": 812, "output_tokens": 96}}),
            &mut result,
            &mut calls,
            &mut usage,
        );

        assert_eq!(result.as_deref(), Some("All done."));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "contacts_list");
        assert_eq!(calls[0].input["q"], "anna");
        let usage = usage.unwrap();
        assert_eq!(usage.input_tokens, Some(812));
        assert_eq!(usage.output_tokens, Some(96));
    }
}
