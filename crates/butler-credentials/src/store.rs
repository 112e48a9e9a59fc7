use butler_db::Db;
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::error::{CredentialError, Result};

/// Metadata-only view of a stored secret. The raw value is intentionally not
/// representable here, so listings and Debug output can never leak it.
#[derive(Debug, Clone, Serialize)]
pub struct SecretMetadata {
    pub key: String,
    pub category: String,
    pub description: Option<String>,
    pub is_sensitive: bool,
    pub expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    /// Which database answered: "local", "shared", "legacy", …
    pub source: String,
}

/// DB-backed secret store with a cross-database fallback chain.
pub struct CredentialStore {
    local: Db,
    /// Consulted in registration order after the local DB misses.
    fallbacks: Vec<(String, Db)>,
}

impl CredentialStore {
    pub fn new(local: Db) -> Result<Self> {
        init_db(&local)?;
        Ok(Self {
            local,
            fallbacks: Vec::new(),
        })
    }

    /// Register a read-only fallback database (typically "shared", then
    /// "legacy"). The table is provisioned if absent so lookups never fail
    /// on a fresh deployment.
    pub fn with_fallback(mut self, label: &str, db: Db) -> Result<Self> {
        init_db(&db)?;
        self.fallbacks.push((label.to_string(), db));
        Ok(self)
    }

    /// Upsert a secret. The key is whitespace-trimmed; empty key or value is
    /// a validation error. The value is never logged.
    pub fn store(
        &self,
        key: &str,
        value: &str,
        category: &str,
        description: Option<&str>,
        is_sensitive: bool,
        expires_at: Option<&str>,
    ) -> Result<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(CredentialError::Validation("secret key must not be empty".into()));
        }
        if value.is_empty() {
            return Err(CredentialError::Validation("secret value must not be empty".into()));
        }
        let now = Utc::now().to_rfc3339();
        self.local.with(|conn| {
            conn.execute(
                "INSERT INTO butler_secrets
                 (key, value, category, description, is_sensitive, expires_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value,
                     category = excluded.category,
                     description = excluded.description,
                     is_sensitive = excluded.is_sensitive,
                     expires_at = excluded.expires_at,
                     updated_at = excluded.updated_at",
                rusqlite::params![
                    key,
                    value,
                    category,
                    description,
                    is_sensitive as i32,
                    expires_at,
                    now
                ],
            )?;
            Ok(())
        })?;
        debug!(key, category, "secret stored");
        Ok(())
    }

    /// DB-only lookup against the local database.
    pub fn load(&self, key: &str) -> Result<Option<String>> {
        lookup(&self.local, key)
    }

    /// Full resolution chain: local DB → fallbacks in order → environment
    /// (only when `env_fallback`; empty env strings count as absent).
    pub fn resolve(&self, key: &str, env_fallback: bool) -> Result<Option<String>> {
        if let Some(value) = lookup(&self.local, key)? {
            return Ok(Some(value));
        }
        for (label, db) in &self.fallbacks {
            if let Some(value) = lookup(db, key)? {
                debug!(key, source = %label, "secret resolved from fallback");
                return Ok(Some(value));
            }
        }
        if env_fallback {
            if let Ok(value) = std::env::var(key) {
                if !value.is_empty() {
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }

    pub fn has(&self, key: &str) -> Result<bool> {
        Ok(self.load(key)?.is_some())
    }

    /// Delete a secret; returns whether a row was removed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let affected = self.local.with(|conn| {
            conn.execute("DELETE FROM butler_secrets WHERE key = ?1", [key])
        })?;
        Ok(affected > 0)
    }

    /// Metadata-only listing; never exposes raw values.
    pub fn list_secrets(&self, category: Option<&str>) -> Result<Vec<SecretMetadata>> {
        let mut out = self.list_from(&self.local, "local", category)?;
        for (label, db) in &self.fallbacks {
            let existing: std::collections::HashSet<String> =
                out.iter().map(|m| m.key.clone()).collect();
            for meta in self.list_from(db, label, category)? {
                if !existing.contains(&meta.key) {
                    out.push(meta);
                }
            }
        }
        Ok(out)
    }

    fn list_from(&self, db: &Db, source: &str, category: Option<&str>) -> Result<Vec<SecretMetadata>> {
        let source = source.to_string();
        let category = category.map(str::to_string);
        Ok(db.with(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, category, description, is_sensitive, expires_at, created_at, updated_at
                 FROM butler_secrets
                 WHERE (?1 IS NULL OR category = ?1)
                 ORDER BY key",
            )?;
            let rows = stmt.query_map([category.as_deref()], |row| {
                Ok(SecretMetadata {
                    key: row.get(0)?,
                    category: row.get(1)?,
                    description: row.get(2)?,
                    is_sensitive: row.get::<_, i32>(3)? != 0,
                    expires_at: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                    source: source.clone(),
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?)
    }

    pub fn local_db(&self) -> &Db {
        &self.local
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Values are deliberately unreachable from here.
        f.debug_struct("CredentialStore")
            .field("local", &self.local.label())
            .field(
                "fallbacks",
                &self.fallbacks.iter().map(|(l, _)| l.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn lookup(db: &Db, key: &str) -> Result<Option<String>> {
    let key = key.to_string();
    Ok(db.with(move |conn| {
        conn.query_row(
            "SELECT value FROM butler_secrets WHERE key = ?1",
            [key.as_str()],
            |row| row.get::<_, String>(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })
    })?)
}

/// Initialise the secrets table. Safe to call on every startup.
pub fn init_db(db: &Db) -> Result<()> {
    db.with(|conn| {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS butler_secrets (
                key          TEXT PRIMARY KEY,
                value        TEXT NOT NULL,
                category     TEXT NOT NULL DEFAULT 'general',
                description  TEXT,
                is_sensitive INTEGER NOT NULL DEFAULT 1,
                expires_at   TEXT,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            );",
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_shared() -> (CredentialStore, Db) {
        let shared = Db::open_in_memory().unwrap();
        let store = CredentialStore::new(Db::open_in_memory().unwrap())
            .unwrap()
            .with_fallback("shared", shared.clone())
            .unwrap();
        (store, shared)
    }

    #[test]
    fn store_and_load_round_trip() {
        let (store, _) = store_with_shared();
        store
            .store("TELEGRAM_BOT_TOKEN", "tok-123", "connector", Some("bot"), true, None)
            .unwrap();
        assert_eq!(store.load("TELEGRAM_BOT_TOKEN").unwrap().as_deref(), Some("tok-123"));
        assert!(store.has("TELEGRAM_BOT_TOKEN").unwrap());
    }

    #[test]
    fn empty_key_and_value_are_rejected() {
        let (store, _) = store_with_shared();
        assert!(matches!(
            store.store("   ", "v", "general", None, true, None),
            Err(CredentialError::Validation(_))
        ));
        assert!(matches!(
            store.store("KEY", "", "general", None, true, None),
            Err(CredentialError::Validation(_))
        ));
    }

    #[test]
    fn key_is_trimmed_on_store() {
        let (store, _) = store_with_shared();
        store.store("  PADDED  ", "v", "general", None, true, None).unwrap();
        assert!(store.has("PADDED").unwrap());
    }

    #[test]
    fn resolve_prefers_local_then_fallback_then_env() {
        let (store, shared) = store_with_shared();
        init_db(&shared).unwrap();
        shared
            .with(|conn| {
                conn.execute(
                    "INSERT INTO butler_secrets (key, value, category, created_at, updated_at)
                     VALUES ('SHARED_ONLY', 'from-shared', 'general', '2026-01-01', '2026-01-01')",
                    [],
                )
            })
            .unwrap();

        assert_eq!(
            store.resolve("SHARED_ONLY", true).unwrap().as_deref(),
            Some("from-shared")
        );

        store.store("SHARED_ONLY", "from-local", "general", None, true, None).unwrap();
        assert_eq!(
            store.resolve("SHARED_ONLY", true).unwrap().as_deref(),
            Some("from-local")
        );
    }

    #[test]
    fn empty_env_string_is_absent() {
        let (store, _) = store_with_shared();
        std::env::set_var("BUTLER_TEST_EMPTY_SECRET", "");
        assert_eq!(store.resolve("BUTLER_TEST_EMPTY_SECRET", true).unwrap(), None);
        std::env::remove_var("BUTLER_TEST_EMPTY_SECRET");
    }

    #[test]
    fn env_fallback_can_be_disabled() {
        let (store, _) = store_with_shared();
        std::env::set_var("BUTLER_TEST_REAL_SECRET", "env-value");
        assert_eq!(store.resolve("BUTLER_TEST_REAL_SECRET", false).unwrap(), None);
        assert_eq!(
            store.resolve("BUTLER_TEST_REAL_SECRET", true).unwrap().as_deref(),
            Some("env-value")
        );
        std::env::remove_var("BUTLER_TEST_REAL_SECRET");
    }

    #[test]
    fn delete_reports_affected_rows() {
        let (store, _) = store_with_shared();
        store.store("GONE", "v", "general", None, true, None).unwrap();
        assert!(store.delete("GONE").unwrap());
        assert!(!store.delete("GONE").unwrap());
    }

    #[test]
    fn listings_and_debug_never_expose_values() {
        let (store, _) = store_with_shared();
        store
            .store("API_KEY", "super-secret-value", "llm", Some("api key"), true, None)
            .unwrap();

        let listed = store.list_secrets(None).unwrap();
        assert_eq!(listed.len(), 1);
        let rendered = format!("{:?}", listed[0]);
        assert!(!rendered.contains("super-secret-value"));
        assert_eq!(listed[0].source, "local");

        let debug = format!("{store:?}");
        assert!(!debug.contains("super-secret-value"));
    }

    #[test]
    fn list_filters_by_category() {
        let (store, _) = store_with_shared();
        store.store("A", "1", "llm", None, true, None).unwrap();
        store.store("B", "2", "connector", None, true, None).unwrap();
        let llm = store.list_secrets(Some("llm")).unwrap();
        assert_eq!(llm.len(), 1);
        assert_eq!(llm[0].key, "A");
    }
}
