use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("database error: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("migration chain '{chain}' is invalid: {reason}")]
    BadChain { chain: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// A single butler database.
///
/// Wraps one SQLite connection in a `Mutex`; every query runs inside an
/// explicit acquire/release scope via [`Db::lease`]. Clones share the same
/// underlying connection, which is the single-writer model each butler
/// guarantees for the databases it owns.
#[derive(Clone)]
pub struct Db {
    label: String,
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (creating if needed) the database at `path`, provisioning parent
    /// directories and the standard pragmas.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|source| DbError::Open {
            path: path.to_string(),
            source,
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=3000;",
        )?;
        info!(db = %path, "database opened");
        Ok(Self {
            label: path.to_string(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests and ephemeral tooling.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            label: ":memory:".to_string(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Acquire the connection for a scoped sequence of queries.
    ///
    /// The guard is the lease: it is released when dropped, so no query can
    /// outlive its acquire/release scope.
    pub fn lease(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run a closure inside one lease.
    pub fn with<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.lease();
        Ok(f(&conn)?)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").field("label", &self.label).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/butler.db");
        let db = Db::open(path.to_str().unwrap()).unwrap();
        db.with(|conn| conn.execute_batch("CREATE TABLE t (x INTEGER);"))
            .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn clones_share_one_connection() {
        let db = Db::open_in_memory().unwrap();
        db.with(|conn| conn.execute_batch("CREATE TABLE t (x INTEGER);"))
            .unwrap();
        let clone = db.clone();
        let count: i64 = clone
            .with(|conn| {
                conn.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE name = 't'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
