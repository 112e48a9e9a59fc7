use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{ModuleError, Result};
use crate::module::Module;

/// Holds every module implementation known to this daemon build.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, Arc<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Arc<dyn Module>) {
        self.modules.insert(module.name().to_string(), module);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.get(name).cloned()
    }

    /// Select the modules enabled in `modules_config` and return them in
    /// topological (dependency-first) order.
    ///
    /// Fails with ConfigError when a configured module is not registered,
    /// when a dependency is not itself configured, or when the dependency
    /// graph has a cycle.
    pub fn load_from_config(
        &self,
        modules_config: &BTreeMap<String, Value>,
    ) -> Result<Vec<Arc<dyn Module>>> {
        let mut selected: BTreeMap<String, Arc<dyn Module>> = BTreeMap::new();
        for name in modules_config.keys() {
            let module = self.modules.get(name).ok_or_else(|| {
                ModuleError::Config(format!("module '{name}' is configured but not registered"))
            })?;
            selected.insert(name.clone(), module.clone());
        }

        for (name, module) in &selected {
            for dep in module.dependencies() {
                if !selected.contains_key(&dep) {
                    return Err(ModuleError::Config(format!(
                        "module '{name}' depends on '{dep}', which is not enabled"
                    )));
                }
            }
        }

        topo_sort(&selected)
    }
}

/// Kahn's algorithm over the selected module set. Ready nodes are drained in
/// name order so the result is deterministic.
fn topo_sort(selected: &BTreeMap<String, Arc<dyn Module>>) -> Result<Vec<Arc<dyn Module>>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut deps_of: HashMap<&str, Vec<String>> = HashMap::new();

    for (name, module) in selected {
        let deps = module.dependencies();
        in_degree.insert(name.as_str(), deps.len());
        deps_of.insert(name.as_str(), deps);
    }
    for (name, deps) in &deps_of {
        for dep in deps {
            if let Some((dep_key, _)) = selected.get_key_value(dep.as_str()) {
                dependents.entry(dep_key.as_str()).or_default().push(*name);
            }
        }
    }

    let mut roots: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    roots.sort_unstable();
    let mut ready: VecDeque<&str> = roots.into();

    let mut order: Vec<Arc<dyn Module>> = Vec::with_capacity(selected.len());
    let mut emitted: HashSet<&str> = HashSet::new();

    while let Some(name) = ready.pop_front() {
        emitted.insert(name);
        order.push(selected[name].clone());

        let mut newly_ready: Vec<&str> = Vec::new();
        if let Some(children) = dependents.get(name) {
            for child in children {
                let degree = in_degree.get_mut(child).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    newly_ready.push(*child);
                }
            }
        }
        newly_ready.sort_unstable();
        for child in newly_ready {
            ready.push_back(child);
        }
    }

    if order.len() != selected.len() {
        let stuck: Vec<&str> = selected
            .keys()
            .map(String::as_str)
            .filter(|n| !emitted.contains(n))
            .collect();
        return Err(ModuleError::Config(format!(
            "module dependency cycle involving: {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}
