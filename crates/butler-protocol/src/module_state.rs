use serde::{Deserialize, Serialize};

/// Runtime health of a registered module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleHealth {
    Active,
    /// `on_startup` raised; `failure_phase` and `failure_error` carry details.
    Failed,
    /// A dependency failed before this module could start.
    CascadeFailed,
}

impl ModuleHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleHealth::Active => "active",
            ModuleHealth::Failed => "failed",
            ModuleHealth::CascadeFailed => "cascade_failed",
        }
    }
}

/// Per-module state as served by `GET /api/butlers/{name}/module-states`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleStateDto {
    pub name: String,
    pub health: ModuleHealth,
    pub enabled: bool,
    pub has_config: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_error: Option<String>,
}
