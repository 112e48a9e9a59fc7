use std::sync::Arc;

use butler_protocol::module_state::ModuleHealth;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use crate::state::ModuleStateController;

/// Async tool handler: JSON arguments in, JSON result out.
pub type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Value> + Send + Sync>;

/// Descriptor served by `tools/list`.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    /// `None` marks a core tool, which is never gated.
    pub owner_module: Option<String>,
}

struct RegisteredTool {
    spec: ToolSpec,
    handler: ToolHandler,
}

/// The butler's tool surface, with module gating on every call.
///
/// A call to a tool whose owning module is disabled (or not active) returns a
/// structured `module_disabled` error without invoking the handler. Tools
/// whose owner is absent from the runtime-state map are NOT gated — that rule
/// matches the original behavior and is documented in DESIGN.md.
pub struct ToolRegistry {
    tools: DashMap<String, RegisteredTool>,
    states: Arc<ModuleStateController>,
}

impl ToolRegistry {
    pub fn new(states: Arc<ModuleStateController>) -> Self {
        Self {
            tools: DashMap::new(),
            states,
        }
    }

    /// Register a core tool (never gated).
    pub fn register_core_tool(
        &self,
        name: &str,
        description: &str,
        input_schema: Value,
        handler: ToolHandler,
    ) {
        self.insert(name, description, input_schema, None, handler);
    }

    /// Register a module-owned tool; calls are gated on the owner's state.
    pub fn register_module_tool(
        &self,
        owner_module: &str,
        name: &str,
        description: &str,
        input_schema: Value,
        handler: ToolHandler,
    ) {
        self.insert(name, description, input_schema, Some(owner_module.to_string()), handler);
    }

    fn insert(
        &self,
        name: &str,
        description: &str,
        input_schema: Value,
        owner_module: Option<String>,
        handler: ToolHandler,
    ) {
        debug!(tool = name, owner = owner_module.as_deref().unwrap_or("core"), "tool registered");
        self.tools.insert(
            name.to_string(),
            RegisteredTool {
                spec: ToolSpec {
                    name: name.to_string(),
                    description: description.to_string(),
                    input_schema,
                    owner_module,
                },
                handler,
            },
        );
    }

    pub fn list(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.iter().map(|e| e.value().spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Invoke a tool through the gate.
    ///
    /// Returns `None` when the tool does not exist. The `module_disabled`
    /// shape is a successful JSON result, not an error — runtime sessions
    /// read it and relay the message to the user.
    pub async fn call(&self, name: &str, args: Value) -> Option<Value> {
        let (owner, handler) = {
            let entry = self.tools.get(name)?;
            (entry.spec.owner_module.clone(), entry.handler.clone())
        };

        if let Some(module) = owner {
            if let Some(state) = self.states.get(&module) {
                if !state.enabled || state.health != ModuleHealth::Active {
                    debug!(tool = name, module = %module, "call rejected: module disabled");
                    return Some(json!({
                        "error": "module_disabled",
                        "module": module,
                        "message": format!(
                            "The {module} module is disabled. Enable it from the dashboard."
                        ),
                    }));
                }
            }
            // Owner missing from the state map: not gated.
        }

        Some((handler)(args).await)
    }
}
