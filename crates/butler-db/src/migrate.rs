use chrono::Utc;
use tracing::{debug, info};

use crate::pool::{Db, DbError, Result};

/// One reversible step in a migration chain.
///
/// Every DDL statement inside `up_sql`/`down_sql` must be guarded
/// (`IF NOT EXISTS` / `IF EXISTS`) so a partially-applied step can be retried.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub revision: &'static str,
    /// `None` marks the chain root.
    pub down_revision: Option<&'static str>,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

/// A named, linear revision history.
#[derive(Debug, Clone)]
pub struct Chain {
    pub name: &'static str,
    pub migrations: &'static [Migration],
}

impl Chain {
    /// The chain must be linear: root first (`down_revision = None`), each
    /// subsequent step pointing at its predecessor.
    fn verify_linear(&self) -> Result<()> {
        let mut prev: Option<&str> = None;
        for m in self.migrations {
            if m.down_revision != prev {
                return Err(DbError::BadChain {
                    chain: self.name.to_string(),
                    reason: format!(
                        "revision {} expects down_revision {:?} but chain has {:?}",
                        m.revision, m.down_revision, prev
                    ),
                });
            }
            prev = Some(m.revision);
        }
        Ok(())
    }
}

fn ensure_ledger(db: &Db) -> Result<()> {
    db.with(|conn| {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                chain      TEXT NOT NULL,
                revision   TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                PRIMARY KEY (chain, revision)
            );",
        )
    })
}

/// Apply every unapplied migration in `chain`, in order. Idempotent: already
/// recorded revisions are skipped. Returns the number of steps applied.
pub fn run_migrations(db: &Db, chain: &Chain) -> Result<usize> {
    chain.verify_linear()?;
    ensure_ledger(db)?;

    let mut applied = 0usize;
    for migration in chain.migrations {
        let already: bool = db.with(|conn| {
            conn.query_row(
                "SELECT 1 FROM schema_migrations WHERE chain = ?1 AND revision = ?2",
                rusqlite::params![chain.name, migration.revision],
                |_| Ok(true),
            )
            .map(|_| true)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(false),
                other => Err(other),
            })
        })?;
        if already {
            debug!(chain = chain.name, revision = migration.revision, "already applied");
            continue;
        }

        db.with(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(migration.up_sql)?;
            tx.execute(
                "INSERT INTO schema_migrations (chain, revision, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![chain.name, migration.revision, Utc::now().to_rfc3339()],
            )?;
            tx.commit()
        })?;
        info!(chain = chain.name, revision = migration.revision, "migration applied");
        applied += 1;
    }
    Ok(applied)
}

/// Roll the chain back until `target` is the newest applied revision.
/// `None` rolls back everything.
pub fn downgrade_to(db: &Db, chain: &Chain, target: Option<&str>) -> Result<usize> {
    chain.verify_linear()?;
    ensure_ledger(db)?;

    let mut reverted = 0usize;
    for migration in chain.migrations.iter().rev() {
        if Some(migration.revision) == target {
            break;
        }
        let recorded: bool = db.with(|conn| {
            conn.query_row(
                "SELECT 1 FROM schema_migrations WHERE chain = ?1 AND revision = ?2",
                rusqlite::params![chain.name, migration.revision],
                |_| Ok(true),
            )
            .map(|_| true)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(false),
                other => Err(other),
            })
        })?;
        if !recorded {
            continue;
        }
        db.with(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(migration.down_sql)?;
            tx.execute(
                "DELETE FROM schema_migrations WHERE chain = ?1 AND revision = ?2",
                rusqlite::params![chain.name, migration.revision],
            )?;
            tx.commit()
        })?;
        info!(chain = chain.name, revision = migration.revision, "migration reverted");
        reverted += 1;
    }
    Ok(reverted)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN: Chain = Chain {
        name: "test",
        migrations: &[
            Migration {
                revision: "t_001",
                down_revision: None,
                up_sql: "CREATE TABLE IF NOT EXISTS widgets (id INTEGER PRIMARY KEY);",
                down_sql: "DROP TABLE IF EXISTS widgets;",
            },
            Migration {
                revision: "t_002",
                down_revision: Some("t_001"),
                up_sql: "CREATE INDEX IF NOT EXISTS idx_widgets_id ON widgets(id);",
                down_sql: "DROP INDEX IF EXISTS idx_widgets_id;",
            },
        ],
    };

    #[test]
    fn apply_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        assert_eq!(run_migrations(&db, &CHAIN).unwrap(), 2);
        assert_eq!(run_migrations(&db, &CHAIN).unwrap(), 0);
    }

    #[test]
    fn downgrade_reverts_in_reverse_order() {
        let db = Db::open_in_memory().unwrap();
        run_migrations(&db, &CHAIN).unwrap();
        assert_eq!(downgrade_to(&db, &CHAIN, Some("t_001")).unwrap(), 1);
        // widgets table survives, index is gone; reapplying restores it.
        assert_eq!(run_migrations(&db, &CHAIN).unwrap(), 1);
    }

    #[test]
    fn non_linear_chain_is_rejected() {
        const BROKEN: Chain = Chain {
            name: "broken",
            migrations: &[Migration {
                revision: "b_001",
                down_revision: Some("ghost"),
                up_sql: "",
                down_sql: "",
            }],
        };
        let db = Db::open_in_memory().unwrap();
        assert!(matches!(
            run_migrations(&db, &BROKEN),
            Err(DbError::BadChain { .. })
        ));
    }
}
