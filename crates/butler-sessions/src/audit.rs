use butler_db::Db;
use chrono::Utc;
use serde_json::Value;
use tracing::warn;

/// Initialise the central audit table (owned by the switchboard database).
pub fn init_db(db: &Db) -> Result<(), butler_db::DbError> {
    db.with(|conn| {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                butler     TEXT NOT NULL,
                kind       TEXT NOT NULL,
                payload    TEXT NOT NULL,
                result     TEXT NOT NULL DEFAULT 'ok',
                error      TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_butler
                ON audit_log(butler, created_at DESC);",
        )
    })?;
    Ok(())
}

/// Append a row to the audit trail.
///
/// Audit failures must never fail the caller: any error is logged at WARN and
/// swallowed. `audit_db` is None for butlers that have no switchboard pool
/// wired (tests, degraded mode) — the call is then a no-op.
pub fn write_audit_entry(
    audit_db: Option<&Db>,
    butler: &str,
    kind: &str,
    payload: &Value,
    result: &str,
    error: Option<&str>,
) {
    let Some(db) = audit_db else {
        return;
    };
    let now = Utc::now().to_rfc3339();
    let (butler, kind) = (butler.to_string(), kind.to_string());
    let (payload, result) = (payload.to_string(), result.to_string());
    let error = error.map(str::to_string);
    let outcome = db.with(move |conn| {
        conn.execute(
            "INSERT INTO audit_log (butler, kind, payload, result, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![butler, kind, payload, result, error, now],
        )
    });
    if let Err(e) = outcome {
        warn!(error = %e, "audit write failed (ignored)");
    }
}
