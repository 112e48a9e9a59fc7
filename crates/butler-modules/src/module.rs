use async_trait::async_trait;
use butler_credentials::CredentialStore;
use butler_db::{Chain, Db};
use serde_json::Value;

use crate::error::Result;
use crate::gate::ToolRegistry;

/// A plugin inside a butler.
///
/// Modules are registered with the daemon builder, instantiated only when
/// their name appears under `[modules]` in butler.toml, and started in
/// dependency order.
#[async_trait]
pub trait Module: Send + Sync {
    /// Stable identifier; also the butler.toml key and the tool-gate owner.
    fn name(&self) -> &str;

    /// JSON-schema-shaped descriptor of the module's config table. Used to
    /// reject unknown fields at daemon start.
    fn config_schema(&self) -> Value {
        serde_json::json!({ "type": "object" })
    }

    /// Names of modules that must start before this one.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Env var keys this module needs forwarded into runtime sessions.
    fn credentials_env(&self) -> Vec<String> {
        Vec::new()
    }

    /// Register this module's tools. Called once at startup, before
    /// `on_startup`; every tool is routed through the gate wrapper.
    fn register_tools(&self, registry: &ToolRegistry, config: &Value, db: &Db);

    /// Name of the migration chain to apply for this module, if any.
    fn migration_chain(&self) -> Option<Chain> {
        None
    }

    async fn on_startup(
        &self,
        config: &Value,
        db: &Db,
        credentials: Option<&CredentialStore>,
    ) -> Result<()>;

    async fn on_shutdown(&self) -> Result<()> {
        Ok(())
    }
}
