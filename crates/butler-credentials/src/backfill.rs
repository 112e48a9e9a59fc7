use butler_db::Db;
use tracing::info;

use crate::error::Result;
use crate::store::init_db;

/// Copy secrets from a legacy shared database into the new shared database.
///
/// Only keys absent from the target are copied; existing rows win. A missing
/// source table (fresh legacy DB, or one never provisioned) is tolerated and
/// copies nothing. Returns the number of keys copied.
pub fn backfill_shared_secrets(legacy: &Db, shared: &Db) -> Result<usize> {
    init_db(shared)?;

    let source_has_table: bool = legacy.with(|conn| {
        conn.query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'butler_secrets'",
            [],
            |_| Ok(true),
        )
        .map(|_| true)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(false),
            other => Err(other),
        })
    })?;
    if !source_has_table {
        info!("legacy database has no butler_secrets table; nothing to backfill");
        return Ok(0);
    }

    type SecretRow = (String, String, String, Option<String>, i32, Option<String>, String, String);
    let rows: Vec<SecretRow> = legacy.with(|conn| {
        let mut stmt = conn.prepare(
            "SELECT key, value, category, description, is_sensitive, expires_at,
                    created_at, updated_at
             FROM butler_secrets",
        )?;
        let mapped = stmt.query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            ))
        })?;
        mapped.collect::<rusqlite::Result<Vec<_>>>()
    })?;

    let mut copied = 0usize;
    for (key, value, category, description, is_sensitive, expires_at, created_at, updated_at) in rows
    {
        let inserted = shared.with(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO butler_secrets
                 (key, value, category, description, is_sensitive, expires_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    key,
                    value,
                    category,
                    description,
                    is_sensitive,
                    expires_at,
                    created_at,
                    updated_at
                ],
            )
        })?;
        copied += inserted;
    }
    if copied > 0 {
        info!(copied, "backfilled secrets from legacy shared database");
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_only_missing_keys() {
        let legacy = Db::open_in_memory().unwrap();
        let shared = Db::open_in_memory().unwrap();
        init_db(&legacy).unwrap();
        init_db(&shared).unwrap();

        for db_key in [("OLD_ONLY", &legacy), ("BOTH", &legacy), ("BOTH", &shared)] {
            db_key
                .1
                .with(|conn| {
                    conn.execute(
                        "INSERT OR REPLACE INTO butler_secrets
                         (key, value, category, created_at, updated_at)
                         VALUES (?1, ?2, 'general', '2026-01-01', '2026-01-01')",
                        rusqlite::params![db_key.0, format!("{}-value", db_key.0)],
                    )
                })
                .unwrap();
        }
        // Distinguish the pre-existing shared value.
        shared
            .with(|conn| {
                conn.execute(
                    "UPDATE butler_secrets SET value = 'shared-wins' WHERE key = 'BOTH'",
                    [],
                )
            })
            .unwrap();

        let copied = backfill_shared_secrets(&legacy, &shared).unwrap();
        assert_eq!(copied, 1);

        let both: String = shared
            .with(|conn| {
                conn.query_row(
                    "SELECT value FROM butler_secrets WHERE key = 'BOTH'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(both, "shared-wins");
    }

    #[test]
    fn tolerates_missing_source_table() {
        let legacy = Db::open_in_memory().unwrap();
        let shared = Db::open_in_memory().unwrap();
        assert_eq!(backfill_shared_secrets(&legacy, &shared).unwrap(), 0);
    }
}
