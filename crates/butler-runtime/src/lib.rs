//! Runtime adapters and the per-butler spawner.
//!
//! An adapter knows how to drive one external LLM CLI (Claude Code, Gemini);
//! the spawner schedules bounded-concurrency ephemeral sessions against the
//! butler's own MCP surface and books every session into the DB.

pub mod adapter;
pub mod claude_cli;
pub mod gemini_cli;
pub mod spawner;

pub use adapter::{AdapterError, Invocation, RuntimeAdapter, ToolCall, Usage};
pub use claude_cli::ClaudeCliAdapter;
pub use gemini_cli::GeminiCliAdapter;
pub use spawner::{MemoryHooks, Spawner, SpawnerError, SpawnerResult};
