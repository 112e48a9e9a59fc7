//! Butler daemon library surface: the orchestrator, HTTP edge, and MCP
//! bridge behind the `butlerd` binary. Exposed as a library so integration
//! tests and embedding hosts can run a daemon in-process.

pub mod daemon;
pub mod http;
pub mod mcp;
pub mod state;

pub use daemon::{default_registry, ButlerDaemon, RunningDaemon};
pub use state::AppState;
