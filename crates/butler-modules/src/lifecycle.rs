use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use butler_credentials::CredentialStore;
use butler_db::Db;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::{ModuleError, Result};
use crate::gate::ToolRegistry;
use crate::module::Module;
use crate::state::ModuleStateController;

/// Start every module in (already topological) order.
///
/// Per module: tools are registered through the gate, then `on_startup` runs.
/// On failure the failing module is marked `failed`, all its transitive
/// dependents become `cascade_failed` without ever starting, the modules that
/// already started are shut down in reverse order (their shutdown errors are
/// swallowed), and the original startup error is re-raised.
pub async fn start_modules(
    modules: &[Arc<dyn Module>],
    configs: &BTreeMap<String, Value>,
    db: &Db,
    credentials: Option<&CredentialStore>,
    states: &ModuleStateController,
    registry: &ToolRegistry,
) -> Result<Vec<Arc<dyn Module>>> {
    let mut started: Vec<Arc<dyn Module>> = Vec::new();

    for (index, module) in modules.iter().enumerate() {
        let name = module.name().to_string();
        let config = configs.get(&name).cloned().unwrap_or(Value::Null);
        let has_config = config.is_object() && !config.as_object().unwrap().is_empty();

        module.register_tools(registry, &config, db);

        match module.on_startup(&config, db, credentials).await {
            Ok(()) => {
                states.mark_active(&name, has_config)?;
                info!(module = %name, "module started");
                started.push(module.clone());
            }
            Err(e) => {
                let message = e.to_string();
                error!(module = %name, error = %message, "module startup failed");
                states.mark_failed(&name, "on_startup", &message, has_config);

                // Everything downstream of the failure never starts.
                for dependent in transitive_dependents(&name, &modules[index + 1..]) {
                    let dep_config_present = configs
                        .get(&dependent)
                        .is_some_and(|c| c.is_object() && !c.as_object().unwrap().is_empty());
                    states.mark_cascade_failed(&dependent, &name, dep_config_present);
                }

                shutdown_modules(&started).await;
                return Err(ModuleError::Startup {
                    module: name,
                    phase: "on_startup".to_string(),
                    message,
                });
            }
        }
    }
    Ok(started)
}

/// Shut modules down in reverse start order, swallowing (but logging) errors.
pub async fn shutdown_modules(started: &[Arc<dyn Module>]) {
    for module in started.iter().rev() {
        if let Err(e) = module.on_shutdown().await {
            warn!(module = module.name(), error = %e, "module shutdown error (ignored)");
        }
    }
}

/// Names of modules in `rest` that (transitively) depend on `root`.
fn transitive_dependents(root: &str, rest: &[Arc<dyn Module>]) -> Vec<String> {
    let mut poisoned: HashSet<String> = HashSet::new();
    poisoned.insert(root.to_string());
    let mut out = Vec::new();
    // `rest` is topologically ordered, so one forward pass is sufficient.
    for module in rest {
        if module
            .dependencies()
            .iter()
            .any(|dep| poisoned.contains(dep))
        {
            poisoned.insert(module.name().to_string());
            out.push(module.name().to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use butler_protocol::module_state::ModuleHealth;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Probe {
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    struct TestModule {
        name: &'static str,
        deps: Vec<String>,
        fail_on_startup: bool,
        probe: Arc<Probe>,
    }

    #[async_trait]
    impl Module for TestModule {
        fn name(&self) -> &str {
            self.name
        }
        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }
        fn register_tools(&self, _registry: &ToolRegistry, _config: &Value, _db: &Db) {}
        async fn on_startup(
            &self,
            _config: &Value,
            _db: &Db,
            _credentials: Option<&CredentialStore>,
        ) -> Result<()> {
            if self.fail_on_startup {
                return Err(ModuleError::Config("intentional failure".into()));
            }
            self.probe.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn on_shutdown(&self) -> Result<()> {
            self.probe.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn harness() -> (Db, Arc<ModuleStateController>, ToolRegistry) {
        let db = Db::open_in_memory().unwrap();
        let states = Arc::new(ModuleStateController::new(db.clone()).unwrap());
        let registry = ToolRegistry::new(states.clone());
        (db, states, registry)
    }

    #[tokio::test]
    async fn failure_cascades_and_cleans_up_exactly_once() {
        let (db, states, registry) = harness();
        let first = Arc::new(Probe::default());
        let second = Arc::new(Probe::default());
        let third = Arc::new(Probe::default());

        // Startup order: ok_module, failing "memory", dependent "contacts".
        let modules: Vec<Arc<dyn Module>> = vec![
            Arc::new(TestModule {
                name: "audit",
                deps: vec![],
                fail_on_startup: false,
                probe: first.clone(),
            }),
            Arc::new(TestModule {
                name: "memory",
                deps: vec![],
                fail_on_startup: true,
                probe: second.clone(),
            }),
            Arc::new(TestModule {
                name: "contacts",
                deps: vec!["memory".into()],
                fail_on_startup: false,
                probe: third.clone(),
            }),
        ];
        let configs: BTreeMap<String, Value> = modules
            .iter()
            .map(|m| (m.name().to_string(), json!({"enabled": true})))
            .collect();

        let err = match start_modules(&modules, &configs, &db, None, &states, &registry).await {
            Err(e) => e,
            Ok(_) => panic!("expected start_modules to fail"),
        };
        assert!(matches!(err, ModuleError::Startup { ref module, .. } if module == "memory"));

        // The dependent never ran on_startup and is cascade_failed.
        assert_eq!(third.started.load(Ordering::SeqCst), 0);
        assert_eq!(
            states.get("contacts").unwrap().health,
            ModuleHealth::CascadeFailed
        );
        assert_eq!(states.get("memory").unwrap().health, ModuleHealth::Failed);
        assert_eq!(
            states.get("memory").unwrap().failure_phase.as_deref(),
            Some("on_startup")
        );

        // The earlier module was shut down exactly once.
        assert_eq!(first.started.load(Ordering::SeqCst), 1);
        assert_eq!(first.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clean_startup_marks_all_active() {
        let (db, states, registry) = harness();
        let probe = Arc::new(Probe::default());
        let modules: Vec<Arc<dyn Module>> = vec![
            Arc::new(TestModule {
                name: "memory",
                deps: vec![],
                fail_on_startup: false,
                probe: probe.clone(),
            }),
            Arc::new(TestModule {
                name: "contacts",
                deps: vec!["memory".into()],
                fail_on_startup: false,
                probe: probe.clone(),
            }),
        ];
        let configs: BTreeMap<String, Value> = modules
            .iter()
            .map(|m| (m.name().to_string(), json!({"x": 1})))
            .collect();

        let started = start_modules(&modules, &configs, &db, None, &states, &registry)
            .await
            .unwrap();
        assert_eq!(started.len(), 2);
        assert_eq!(states.get("memory").unwrap().health, ModuleHealth::Active);
        assert!(states.get("contacts").unwrap().enabled);
    }
}
