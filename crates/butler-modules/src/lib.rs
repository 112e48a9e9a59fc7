//! Module plugin contract and runtime.
//!
//! A module contributes tools, migrations, credentials, and startup/shutdown
//! hooks to its butler. The registry resolves the dependency DAG, the state
//! controller tracks health + enabled flags, and the tool gate rejects calls
//! into disabled modules without invoking their handlers.

pub mod approvals;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod module;
pub mod registry;
pub mod state;

pub use approvals::{ActionStatus, ApprovalStore, PendingAction};
pub use error::{ModuleError, Result};
pub use gate::{ToolHandler, ToolRegistry, ToolSpec};
pub use lifecycle::{shutdown_modules, start_modules};
pub use module::Module;
pub use registry::ModuleRegistry;
pub use state::{ModuleRuntimeState, ModuleStateController, StateChangeError};
