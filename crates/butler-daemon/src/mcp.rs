//! MCP stdio bridge for CLI runtimes.
//!
//! Exposes this butler's memory tools as an MCP server the runtime CLI
//! discovers through its generated config file. Runs against the butler
//! database directly; daemon-side tools stay behind the daemon's own surface.
//!
//! Protocol: JSON-RPC 2.0 over stdin/stdout (one JSON object per line).

use std::io::Write;

use butler_core::config::ButlerConfig;
use butler_memory::{MemoryKind, MemoryStore, Permanence};
use serde_json::{json, Value};

/// Run the MCP bridge stdio loop. Blocks until stdin is closed.
pub fn run_bridge(config: &ButlerConfig) -> anyhow::Result<()> {
    // Open the butler database directly — no need for the full daemon stack.
    let db = butler_db::Db::open(&config.db.path_for(&config.name))?;
    let memory = MemoryStore::new(db)?;

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = std::io::BufReader::new(stdin.lock());
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = std::io::BufRead::read_line(&mut reader, &mut line)?;
        if bytes_read == 0 {
            break; // EOF — the runtime closed the pipe.
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                write_response(
                    &stdout,
                    json!(null),
                    Some(json!({"code": -32700, "message": format!("Parse error: {e}")})),
                    None,
                )?;
                continue;
            }
        };

        let id = request.get("id").cloned().unwrap_or(json!(null));
        let method = request.get("method").and_then(|v| v.as_str()).unwrap_or("");
        let is_notification = request.get("id").is_none();

        match method {
            "initialize" => {
                write_response(
                    &stdout,
                    id,
                    None,
                    Some(json!({
                        "protocolVersion": "2025-06-18",
                        "capabilities": { "tools": {} },
                        "serverInfo": {
                            "name": config.name,
                            "version": env!("CARGO_PKG_VERSION")
                        }
                    })),
                )?;
            }

            "notifications/initialized" => {}

            "tools/list" => {
                write_response(&stdout, id, None, Some(json!({ "tools": tool_definitions() })))?;
            }

            "tools/call" => {
                let params = request.get("params").cloned().unwrap_or(json!({}));
                let tool_name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
                let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

                match execute_tool(&memory, tool_name, &arguments) {
                    Ok(content) => write_response(
                        &stdout,
                        id,
                        None,
                        Some(json!({
                            "content": [{"type": "text", "text": content}],
                            "isError": false
                        })),
                    )?,
                    Err(message) => write_response(
                        &stdout,
                        id,
                        None,
                        Some(json!({
                            "content": [{"type": "text", "text": message}],
                            "isError": true
                        })),
                    )?,
                }
            }

            _ => {
                if !is_notification {
                    write_response(
                        &stdout,
                        id,
                        Some(json!({
                            "code": -32601,
                            "message": format!("Method not found: {method}")
                        })),
                        None,
                    )?;
                }
            }
        }
    }
    Ok(())
}

fn tool_definitions() -> Value {
    json!([
        {
            "name": "memory_store_fact",
            "description": "Store a subject/predicate fact; supersedes the previous value",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "subject": {"type": "string"},
                    "predicate": {"type": "string"},
                    "content": {"type": "string"},
                    "scope": {"type": "string"},
                    "permanence": {"type": "string"}
                },
                "required": ["subject", "predicate", "content"]
            }
        },
        {
            "name": "memory_get",
            "description": "Fetch a memory item by kind and id",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "kind": {"type": "string", "enum": ["episode", "fact", "rule"]},
                    "id": {"type": "string"}
                },
                "required": ["kind", "id"]
            }
        },
        {
            "name": "memory_forget",
            "description": "Soft-delete a memory item",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "kind": {"type": "string", "enum": ["episode", "fact", "rule"]},
                    "id": {"type": "string"}
                },
                "required": ["kind", "id"]
            }
        }
    ])
}

fn execute_tool(memory: &MemoryStore, tool_name: &str, arguments: &Value) -> Result<String, String> {
    let text_arg = |key: &str| {
        arguments
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };

    match tool_name {
        "memory_store_fact" => {
            let permanence = text_arg("permanence")
                .and_then(|s| s.parse::<Permanence>().ok())
                .unwrap_or(Permanence::Standard);
            let id = memory
                .store_fact(
                    &text_arg("subject").ok_or("missing subject")?,
                    &text_arg("predicate").ok_or("missing predicate")?,
                    &text_arg("content").ok_or("missing content")?,
                    &text_arg("scope").unwrap_or_else(|| "global".to_string()),
                    permanence,
                )
                .map_err(|e| e.to_string())?;
            Ok(json!({"id": id}).to_string())
        }
        "memory_get" => {
            let kind = text_arg("kind")
                .ok_or("missing kind")?
                .parse::<MemoryKind>()?;
            let record = memory
                .get_memory(kind, &text_arg("id").ok_or("missing id")?)
                .map_err(|e| e.to_string())?;
            Ok(serde_json::to_string(&record).map_err(|e| e.to_string())?)
        }
        "memory_forget" => {
            let kind = text_arg("kind")
                .ok_or("missing kind")?
                .parse::<MemoryKind>()?;
            memory
                .forget_memory(kind, &text_arg("id").ok_or("missing id")?)
                .map_err(|e| e.to_string())?;
            Ok(json!({"status": "ok"}).to_string())
        }
        other => Err(format!("Unknown tool: {other}")),
    }
}

fn write_response(
    stdout: &std::io::Stdout,
    id: Value,
    error: Option<Value>,
    result: Option<Value>,
) -> std::io::Result<()> {
    let mut body = json!({"jsonrpc": "2.0", "id": id});
    if let Some(error) = error {
        body["error"] = error;
    }
    if let Some(result) = result {
        body["result"] = result;
    }
    let mut handle = stdout.lock();
    writeln!(handle, "{body}")?;
    handle.flush()
}
