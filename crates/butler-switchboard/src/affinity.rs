use butler_db::Db;
use chrono::Utc;

use crate::error::Result;

/// Tuning for the email thread-affinity lookup.
#[derive(Debug, Clone)]
pub struct ThreadAffinitySettings {
    /// Days after which a recorded affinity stops being authoritative.
    pub max_age_days: i64,
}

impl Default for ThreadAffinitySettings {
    fn default() -> Self {
        Self { max_age_days: 30 }
    }
}

fn thread_key(channel: &str, endpoint_identity: &str, thread_id: &str) -> String {
    format!("{channel}:{endpoint_identity}:{thread_id}")
}

/// Which butler previously handled this email thread, if any.
pub fn lookup_thread_affinity(
    db: &Db,
    channel: &str,
    endpoint_identity: &str,
    thread_id: &str,
    settings: &ThreadAffinitySettings,
) -> Result<Option<String>> {
    let key = thread_key(channel, endpoint_identity, thread_id);
    let cutoff = (Utc::now() - chrono::Duration::days(settings.max_age_days)).to_rfc3339();
    Ok(db.with(move |conn| {
        conn.query_row(
            "SELECT butler_name FROM thread_affinity
             WHERE thread_key = ?1 AND updated_at >= ?2",
            rusqlite::params![key, cutoff],
            |row| row.get::<_, String>(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })
    })?)
}

/// Remember where a thread was routed so follow-ups stay with that butler.
pub fn record_thread_affinity(
    db: &Db,
    channel: &str,
    endpoint_identity: &str,
    thread_id: &str,
    butler_name: &str,
) -> Result<()> {
    let key = thread_key(channel, endpoint_identity, thread_id);
    let now = Utc::now().to_rfc3339();
    let butler = butler_name.to_string();
    db.with(move |conn| {
        conn.execute(
            "INSERT INTO thread_affinity (thread_key, butler_name, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(thread_key) DO UPDATE SET
                 butler_name = excluded.butler_name,
                 updated_at = excluded.updated_at",
            rusqlite::params![key, butler, now],
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SWITCHBOARD_CHAIN;
    use butler_db::run_migrations;

    fn db() -> Db {
        let db = Db::open_in_memory().unwrap();
        run_migrations(&db, &SWITCHBOARD_CHAIN).unwrap();
        db
    }

    #[test]
    fn record_then_lookup_round_trips() {
        let db = db();
        let settings = ThreadAffinitySettings::default();
        assert!(lookup_thread_affinity(&db, "email", "me@x.com", "t-1", &settings)
            .unwrap()
            .is_none());

        record_thread_affinity(&db, "email", "me@x.com", "t-1", "finance").unwrap();
        assert_eq!(
            lookup_thread_affinity(&db, "email", "me@x.com", "t-1", &settings)
                .unwrap()
                .as_deref(),
            Some("finance")
        );

        // Re-routing updates the affinity.
        record_thread_affinity(&db, "email", "me@x.com", "t-1", "travel").unwrap();
        assert_eq!(
            lookup_thread_affinity(&db, "email", "me@x.com", "t-1", &settings)
                .unwrap()
                .as_deref(),
            Some("travel")
        );
    }

    #[test]
    fn stale_affinity_is_ignored() {
        let db = db();
        record_thread_affinity(&db, "email", "me@x.com", "t-2", "health").unwrap();
        let strict = ThreadAffinitySettings { max_age_days: 0 };
        // Backdate the row so the zero-day cutoff excludes it.
        db.with(|conn| {
            conn.execute(
                "UPDATE thread_affinity SET updated_at = '2000-01-01T00:00:00+00:00'",
                [],
            )
        })
        .unwrap();
        assert!(lookup_thread_affinity(&db, "email", "me@x.com", "t-2", &strict)
            .unwrap()
            .is_none());
    }
}
