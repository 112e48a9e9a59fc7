use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::adapter::{
    stderr_excerpt, AdapterError, Invocation, RuntimeAdapter, ToolCall, Usage,
};

/// Secrets meant for other runtimes; never forwarded to the Gemini CLI.
const FOREIGN_ENV: &[&str] = &["ANTHROPIC_API_KEY"];

/// Runtime adapter for the Gemini CLI.
///
/// System prompt priority is `GEMINI.md`, then `AGENTS.md`; Claude's file is
/// never read. Tool calls arrive as `functionCall` events in the JSON stream.
pub struct GeminiCliAdapter {
    command: String,
}

impl GeminiCliAdapter {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl RuntimeAdapter for GeminiCliAdapter {
    fn name(&self) -> &str {
        "gemini-cli"
    }

    fn parse_system_prompt_file(&self, config_dir: &Path) -> std::io::Result<String> {
        for candidate in ["GEMINI.md", "AGENTS.md"] {
            match std::fs::read_to_string(config_dir.join(candidate)) {
                Ok(text) => return Ok(text),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(String::new())
    }

    fn build_config_file(
        &self,
        mcp_servers: &BTreeMap<String, String>,
        tmp_dir: &Path,
    ) -> std::io::Result<PathBuf> {
        let servers: serde_json::Map<String, serde_json::Value> = mcp_servers
            .iter()
            .map(|(name, url)| (name.clone(), serde_json::json!({ "url": url })))
            .collect();
        let config = serde_json::json!({ "mcpServers": servers });
        let path = tmp_dir.join("settings.json");
        std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;
        Ok(path)
    }

    async fn invoke(
        &self,
        invocation: Invocation,
    ) -> Result<(Option<String>, Vec<ToolCall>, Option<Usage>), AdapterError> {
        let tmp = tempfile::Builder::new()
            .prefix("butler-gemini-")
            .tempdir()
            .map_err(|e| AdapterError::Unavailable(format!("failed to create temp dir: {e}")))?;
        let settings_path = self.build_config_file(&invocation.mcp_servers, tmp.path())?;

        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.arg("--output-format")
            .arg("stream-json")
            .arg("--max-turns")
            .arg(invocation.max_turns.to_string())
            .arg("--settings")
            .arg(&settings_path)
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
        for (key, value) in &invocation.env {
            if FOREIGN_ENV.contains(&key.as_str()) {
                continue;
            }
            cmd.env(key, value);
        }

        debug!(command = %self.command, prompt_len = invocation.prompt.len(), "spawning gemini CLI");

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AdapterError::Unavailable(format!(
                    "gemini CLI not found at '{}'",
                    self.command
                ))
            } else {
                AdapterError::Unavailable(format!("failed to spawn gemini CLI: {e}"))
            }
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // The system prompt travels inline: the Gemini CLI has no
            // system-prompt-file flag in pipe mode.
            let full = if invocation.system_prompt.is_empty() {
                invocation.prompt.clone()
            } else {
                format!("{}\n\n{}", invocation.system_prompt, invocation.prompt)
            };
            stdin.write_all(full.as_bytes()).await?;
            drop(stdin);
        }

        let run = drive_child(&mut child);
        match invocation.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(res) => res,
                Err(_) => {
                    let _ = child.kill().await;
                    Err(AdapterError::Timeout(limit))
                }
            },
            None => run.await,
        }
    }

    fn create_worker(&self) -> Box<dyn RuntimeAdapter> {
        Box::new(Self {
            command: self.command.clone(),
        })
    }
}

async fn drive_child(
    child: &mut tokio::process::Child,
) -> Result<(Option<String>, Vec<ToolCall>, Option<Usage>), AdapterError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AdapterError::Unavailable("gemini stdout not captured".into()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| AdapterError::Unavailable("gemini stderr not captured".into()))?;

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
                warn!(error = %e, "skipping unparseable gemini event line");
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

fn fold_event(
    event: &serde_json::Value,
    result_text: &mut Option<String>,
    tool_calls: &mut Vec<ToolCall>,
    usage: &mut Option<Usage>,
) {
    if let Some(call) = event.get("functionCall") {
        tool_calls.push(ToolCall {
            id: call
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("fc_{}", tool_calls.len() + 1)),
            name: call.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            input: call.get("args").cloned().unwrap_or(serde_json::json!({})),
        });
        return;
    }
    match event.get("type").and_then(|t| t.as_str()) {
        Some("result") => {
            *result_text = event
                .get("response")
                .or_else(|| event.get("result"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let input = event
                .pointer("/stats/promptTokenCount")
                .and_then(|v| v.as_i64());
            let output = event
                .pointer("/stats/candidatesTokenCount")
                .and_then(|v| v.as_i64());
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
    fn prefers_gemini_md_then_agents_md_never_claude_md() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("CLAUDE.md"), "claude prompt").unwrap();
        let adapter = GeminiCliAdapter::new("gemini");
        assert_eq!(adapter.parse_system_prompt_file(dir.path()).unwrap(), "");

        std::fs::write(dir.path().join("AGENTS.md"), "agents prompt").unwrap();
        assert_eq!(
            adapter.parse_system_prompt_file(dir.path()).unwrap(),
            "agents prompt"
        );

        std::fs::write(dir.path().join("GEMINI.md"), "gemini prompt").unwrap();
        assert_eq!(
            adapter.parse_system_prompt_file(dir.path()).unwrap(),
            "gemini prompt"
        );
    }

    #[test]
    fn function_calls_normalise_to_tool_calls() {
        let mut result = None;
        let mut calls = Vec::new();
        let mut usage = None;

        fold_event(
            &json!({"functionCall": {"name": "trips_list", "args": {"year": 2026}}}),
            &mut result,
            &mut calls,
            &mut usage,
        );
        fold_event(
            &json!({"type": "result", "response": "ok",
                    "stats": {"promptTokenCount": 40, "candidatesTokenCount": 7}}),
            &mut result,
            &mut calls,
            &mut usage,
        );

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "trips_list");
        assert_eq!(calls[0].input["year"], 2026);
        assert!(!calls[0].id.is_empty());
        assert_eq!(result.as_deref(), Some("ok"));
        assert_eq!(usage.unwrap().input_tokens, Some(40));
    }
}
