use butler_db::Db;
use butler_protocol::module_state::{ModuleHealth, ModuleStateDto};
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tracing::info;

use crate::error::Result;

/// In-memory runtime state for one registered module.
#[derive(Debug, Clone)]
pub struct ModuleRuntimeState {
    pub health: ModuleHealth,
    pub enabled: bool,
    pub has_config: bool,
    pub failure_phase: Option<String>,
    pub failure_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum StateChangeError {
    #[error("Unknown module: {0}")]
    UnknownModule(String),

    /// Surfaces as 409 at the REST edge — a failed module cannot be toggled.
    #[error("Module '{0}' is unavailable (health: failed)")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] butler_db::DbError),
}

/// Owns the `module_runtime_states` map for one butler daemon.
///
/// Readers (the tool-call gate) take lock-free snapshots of single entries;
/// writers are startup and `set_module_enabled`, each swapping a whole entry
/// atomically.
pub struct ModuleStateController {
    db: Db,
    states: DashMap<String, ModuleRuntimeState>,
}

impl ModuleStateController {
    pub fn new(db: Db) -> Result<Self> {
        init_db(&db)?;
        Ok(Self {
            db,
            states: DashMap::new(),
        })
    }

    /// Load the persisted enabled flag, if any toggle was ever saved.
    fn persisted_enabled(&self, module: &str) -> Result<Option<bool>> {
        let module = module.to_string();
        Ok(self.db.with(move |conn| {
            conn.query_row(
                "SELECT enabled FROM module_state WHERE module = ?1",
                [module.as_str()],
                |row| row.get::<_, i32>(0).map(|v| v != 0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?)
    }

    /// Successful startup: health = active, enabled = last persisted state
    /// (defaulting to true for modules never toggled).
    pub fn mark_active(&self, module: &str, has_config: bool) -> Result<()> {
        let enabled = self.persisted_enabled(module)?.unwrap_or(true);
        self.states.insert(
            module.to_string(),
            ModuleRuntimeState {
                health: ModuleHealth::Active,
                enabled,
                has_config,
                failure_phase: None,
                failure_error: None,
            },
        );
        Ok(())
    }

    pub fn mark_failed(&self, module: &str, phase: &str, error: &str, has_config: bool) {
        self.states.insert(
            module.to_string(),
            ModuleRuntimeState {
                health: ModuleHealth::Failed,
                enabled: false,
                has_config,
                failure_phase: Some(phase.to_string()),
                failure_error: Some(error.to_string()),
            },
        );
    }

    pub fn mark_cascade_failed(&self, module: &str, failed_dependency: &str, has_config: bool) {
        self.states.insert(
            module.to_string(),
            ModuleRuntimeState {
                health: ModuleHealth::CascadeFailed,
                enabled: false,
                has_config,
                failure_phase: Some("dependency".to_string()),
                failure_error: Some(format!("dependency '{failed_dependency}' failed to start")),
            },
        );
    }

    /// Read-only snapshot, sorted by module name.
    pub fn get_module_states(&self) -> Vec<ModuleStateDto> {
        let mut out: Vec<ModuleStateDto> = self
            .states
            .iter()
            .map(|entry| to_dto(entry.key(), entry.value()))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn get(&self, module: &str) -> Option<ModuleRuntimeState> {
        self.states.get(module).map(|e| e.value().clone())
    }

    /// Toggle a module at runtime. Persists the flag, then swaps the
    /// in-memory entry so the tool gate observes the change on its next call.
    pub fn set_module_enabled(
        &self,
        module: &str,
        enabled: bool,
    ) -> std::result::Result<ModuleStateDto, StateChangeError> {
        let Some(current) = self.states.get(module).map(|e| e.value().clone()) else {
            return Err(StateChangeError::UnknownModule(module.to_string()));
        };
        if current.health == ModuleHealth::Failed {
            return Err(StateChangeError::Unavailable(module.to_string()));
        }

        let now = Utc::now().to_rfc3339();
        let module_owned = module.to_string();
        self.db.with(move |conn| {
            conn.execute(
                "INSERT INTO module_state (module, enabled, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(module) DO UPDATE SET
                     enabled = excluded.enabled,
                     updated_at = excluded.updated_at",
                rusqlite::params![module_owned, enabled as i32, now],
            )
        })?;

        let mut updated = current;
        updated.enabled = enabled;
        self.states.insert(module.to_string(), updated.clone());
        info!(module, enabled, "module enabled flag changed");
        Ok(to_dto(module, &updated))
    }
}

fn to_dto(name: &str, state: &ModuleRuntimeState) -> ModuleStateDto {
    ModuleStateDto {
        name: name.to_string(),
        health: state.health,
        enabled: state.enabled,
        has_config: state.has_config,
        failure_phase: state.failure_phase.clone(),
        failure_error: state.failure_error.clone(),
    }
}

fn init_db(db: &Db) -> Result<()> {
    db.with(|conn| {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS module_state (
                module     TEXT PRIMARY KEY,
                enabled    INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> ModuleStateController {
        ModuleStateController::new(Db::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn toggle_persists_and_survives_restart_seed() {
        let db = Db::open_in_memory().unwrap();
        let ctrl = ModuleStateController::new(db.clone()).unwrap();
        ctrl.mark_active("memory", true).unwrap();
        ctrl.set_module_enabled("memory", false).unwrap();

        // A fresh controller over the same DB seeds enabled=false.
        let ctrl2 = ModuleStateController::new(db).unwrap();
        ctrl2.mark_active("memory", true).unwrap();
        assert!(!ctrl2.get("memory").unwrap().enabled);
    }

    #[test]
    fn unknown_module_toggle_fails() {
        let ctrl = controller();
        assert!(matches!(
            ctrl.set_module_enabled("ghost", true),
            Err(StateChangeError::UnknownModule(_))
        ));
    }

    #[test]
    fn failed_module_toggle_is_unavailable() {
        let ctrl = controller();
        ctrl.mark_failed("gmail", "on_startup", "boom", true);
        assert!(matches!(
            ctrl.set_module_enabled("gmail", true),
            Err(StateChangeError::Unavailable(_))
        ));
    }

    #[test]
    fn cascade_failed_records_the_dependency() {
        let ctrl = controller();
        ctrl.mark_cascade_failed("contacts", "memory", true);
        let state = ctrl.get("contacts").unwrap();
        assert_eq!(state.health, ModuleHealth::CascadeFailed);
        assert!(state.failure_error.unwrap().contains("memory"));
    }

    #[test]
    fn snapshot_is_sorted() {
        let ctrl = controller();
        ctrl.mark_active("zeta", false).unwrap();
        ctrl.mark_active("alpha", true).unwrap();
        let names: Vec<String> = ctrl
            .get_module_states()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
