use std::collections::BTreeMap;

use tracing::warn;

use crate::error::{CredentialError, Result};
use crate::store::CredentialStore;

/// Required variables partitioned by where the requirement came from.
#[derive(Debug, Clone, Default)]
pub struct RequiredCredentials {
    /// Framework-level variables every butler needs.
    pub core: Vec<String>,
    /// `env_required` from butler.toml.
    pub butler_env: Vec<String>,
    /// `credentials_env` per enabled module.
    pub modules: BTreeMap<String, Vec<String>>,
    /// `env_optional` — absence only warns.
    pub optional: Vec<String>,
}

/// Check every required variable through the store's full resolution chain
/// (DB first, env fallback) and raise one aggregated error naming every
/// missing variable and its source. Optional variables only produce warnings.
pub fn validate_credentials(store: &CredentialStore, required: &RequiredCredentials) -> Result<()> {
    let mut missing: Vec<(String, String)> = Vec::new();

    for var in &required.core {
        if store.resolve(var, true)?.is_none() {
            missing.push((var.clone(), "core".to_string()));
        }
    }
    for var in &required.butler_env {
        if store.resolve(var, true)?.is_none() {
            missing.push((var.clone(), "butler.env".to_string()));
        }
    }
    for (module, vars) in &required.modules {
        for var in vars {
            if store.resolve(var, true)?.is_none() {
                missing.push((var.clone(), format!("module:{module}")));
            }
        }
    }

    for var in &required.optional {
        if store.resolve(var, true)?.is_none() {
            warn!(var = %var, "optional credential not set");
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(CredentialError::MissingRequired { missing })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use butler_db::Db;

    fn empty_store() -> CredentialStore {
        CredentialStore::new(Db::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn aggregates_every_missing_variable_with_source() {
        let store = empty_store();
        let mut required = RequiredCredentials {
            core: vec!["ANTHROPIC_API_KEY_MISSING_T1".into()],
            butler_env: vec!["BUTLER_ENV_MISSING_T1".into()],
            ..RequiredCredentials::default()
        };
        required
            .modules
            .insert("gmail".into(), vec!["GMAIL_TOKEN_MISSING_T1".into()]);

        let err = validate_credentials(&store, &required).unwrap_err();
        let CredentialError::MissingRequired { missing } = err else {
            panic!("expected MissingRequired");
        };
        assert_eq!(missing.len(), 3);
        assert!(missing.contains(&("ANTHROPIC_API_KEY_MISSING_T1".into(), "core".into())));
        assert!(missing.contains(&("BUTLER_ENV_MISSING_T1".into(), "butler.env".into())));
        assert!(missing.contains(&("GMAIL_TOKEN_MISSING_T1".into(), "module:gmail".into())));
    }

    #[test]
    fn db_backed_secret_satisfies_requirement() {
        let store = empty_store();
        store
            .store("DB_BACKED_VAR_T2", "present", "general", None, true, None)
            .unwrap();
        let required = RequiredCredentials {
            core: vec!["DB_BACKED_VAR_T2".into()],
            ..RequiredCredentials::default()
        };
        validate_credentials(&store, &required).unwrap();
    }

    #[test]
    fn optional_absence_does_not_fail() {
        let store = empty_store();
        let required = RequiredCredentials {
            optional: vec!["TOTALLY_OPTIONAL_VAR_T3".into()],
            ..RequiredCredentials::default()
        };
        validate_credentials(&store, &required).unwrap();
    }
}
