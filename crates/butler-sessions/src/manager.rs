use butler_db::Db;
use chrono::Utc;
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, butler_db::DbError>;

/// One ephemeral runtime session, as persisted before and after invocation.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    /// Time-ordered (v7) id minted at creation.
    pub id: Uuid,
    pub prompt: String,
    pub trigger_source: String,
    pub trace_id: Option<String>,
    pub model: String,
    pub request_id: Option<String>,
    pub output: Option<String>,
    pub tool_calls: serde_json::Value,
    pub duration_ms: Option<i64>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Session bookkeeping for one butler.
pub struct SessionStore {
    db: Db,
}

impl SessionStore {
    pub fn new(db: Db) -> Result<Self> {
        init_db(&db)?;
        Ok(Self { db })
    }

    /// Persist a session row at dispatch time, before the runtime spawns.
    #[instrument(skip(self, prompt), fields(trigger_source))]
    pub fn session_create(
        &self,
        prompt: &str,
        trigger_source: &str,
        trace_id: Option<&str>,
        model: &str,
        request_id: Option<&str>,
    ) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let now = Utc::now().to_rfc3339();
        let (id_str, prompt, source, model) = (
            id.to_string(),
            prompt.to_string(),
            trigger_source.to_string(),
            model.to_string(),
        );
        let (trace, request) = (trace_id.map(str::to_string), request_id.map(str::to_string));
        self.db.with(move |conn| {
            conn.execute(
                "INSERT INTO sessions
                 (id, prompt, trigger_source, trace_id, model, request_id, tool_calls, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, '[]', ?7)",
                rusqlite::params![id_str, prompt, source, trace, model, request, now],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Complete a session row with the invocation outcome.
    #[allow(clippy::too_many_arguments)]
    pub fn session_complete(
        &self,
        id: Uuid,
        output: Option<&str>,
        tool_calls: &serde_json::Value,
        duration_ms: i64,
        success: bool,
        error: Option<&str>,
        input_tokens: Option<i64>,
        output_tokens: Option<i64>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let (id_str, output) = (id.to_string(), output.map(str::to_string));
        let (calls, error) = (tool_calls.to_string(), error.map(str::to_string));
        self.db.with(move |conn| {
            conn.execute(
                "UPDATE sessions
                 SET output = ?1, tool_calls = ?2, duration_ms = ?3, success = ?4,
                     error = ?5, input_tokens = ?6, output_tokens = ?7, completed_at = ?8
                 WHERE id = ?9",
                rusqlite::params![
                    output,
                    calls,
                    duration_ms,
                    success as i32,
                    error,
                    input_tokens,
                    output_tokens,
                    now,
                    id_str
                ],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Option<SessionRecord>> {
        let id_str = id.to_string();
        self.db.with(move |conn| {
            conn.query_row(
                "SELECT id, prompt, trigger_source, trace_id, model, request_id, output,
                        tool_calls, duration_ms, success, error, input_tokens, output_tokens,
                        created_at, completed_at
                 FROM sessions WHERE id = ?1",
                [id_str.as_str()],
                row_to_session,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
        .map_err(Into::into)
    }

    /// Most recent sessions, newest first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        self.db.with(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, prompt, trigger_source, trace_id, model, request_id, output,
                        tool_calls, duration_ms, success, error, input_tokens, output_tokens,
                        created_at, completed_at
                 FROM sessions ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit as i64], row_to_session)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .map_err(Into::into)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let id_str: String = row.get(0)?;
    let tool_calls: String = row.get(7)?;
    Ok(SessionRecord {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        prompt: row.get(1)?,
        trigger_source: row.get(2)?,
        trace_id: row.get(3)?,
        model: row.get(4)?,
        request_id: row.get(5)?,
        output: row.get(6)?,
        tool_calls: serde_json::from_str(&tool_calls).unwrap_or(serde_json::Value::Null),
        duration_ms: row.get(8)?,
        success: row.get::<_, Option<i32>>(9)?.map(|v| v != 0),
        error: row.get(10)?,
        input_tokens: row.get(11)?,
        output_tokens: row.get(12)?,
        created_at: row.get(13)?,
        completed_at: row.get(14)?,
    })
}

/// Initialise the sessions table. Safe to call on every startup.
pub fn init_db(db: &Db) -> Result<()> {
    db.with(|conn| {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id             TEXT PRIMARY KEY,
                prompt         TEXT NOT NULL,
                trigger_source TEXT NOT NULL,
                trace_id       TEXT,
                model          TEXT NOT NULL,
                request_id     TEXT,
                output         TEXT,
                tool_calls     TEXT NOT NULL DEFAULT '[]',
                duration_ms    INTEGER,
                success        INTEGER,
                error          TEXT,
                input_tokens   INTEGER,
                output_tokens  INTEGER,
                created_at     TEXT NOT NULL,
                completed_at   TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_source
                ON sessions(trigger_source, created_at DESC);",
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_complete_round_trip() {
        let store = SessionStore::new(Db::open_in_memory().unwrap()).unwrap();
        let id = store
            .session_create("do the thing", "external", Some("abc123"), "claude-sonnet-4-6", None)
            .unwrap();

        store
            .session_complete(
                id,
                Some("done"),
                &serde_json::json!([{"id": "t1", "name": "ping", "input": {}}]),
                1200,
                true,
                None,
                Some(900),
                Some(120),
            )
            .unwrap();

        let session = store.get(id).unwrap().unwrap();
        assert_eq!(session.output.as_deref(), Some("done"));
        assert_eq!(session.success, Some(true));
        assert_eq!(session.input_tokens, Some(900));
        assert_eq!(session.tool_calls[0]["name"], "ping");
    }

    #[test]
    fn listing_orders_by_time_ordered_id() {
        let store = SessionStore::new(Db::open_in_memory().unwrap()).unwrap();
        let first = store
            .session_create("one", "tick", None, "m", None)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = store
            .session_create("two", "tick", None, "m", None)
            .unwrap();

        let recent = store.list_recent(10).unwrap();
        assert_eq!(recent[0].id, second);
        assert_eq!(recent[1].id, first);
    }

    #[test]
    fn failed_session_records_error() {
        let store = SessionStore::new(Db::open_in_memory().unwrap()).unwrap();
        let id = store
            .session_create("boom", "trigger", None, "m", None)
            .unwrap();
        store
            .session_complete(id, None, &serde_json::json!([]), 5, false, Some("adapter died"), None, None)
            .unwrap();
        let session = store.get(id).unwrap().unwrap();
        assert_eq!(session.success, Some(false));
        assert_eq!(session.error.as_deref(), Some("adapter died"));
    }
}
