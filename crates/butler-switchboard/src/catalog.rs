use butler_db::Db;
use chrono::Utc;

use crate::error::Result;

/// One routable butler as advertised to the classifier.
#[derive(Debug, Clone)]
pub struct ButlerEntry {
    pub name: String,
    pub description: String,
    pub eligibility_state: String,
    pub last_heartbeat_at: Option<String>,
}

/// Register or update a butler in the catalog (called at daemon connect).
pub fn upsert_butler(db: &Db, name: &str, description: &str, endpoint_url: Option<&str>) -> Result<()> {
    let (name, description) = (name.to_string(), description.to_string());
    let endpoint = endpoint_url.map(str::to_string);
    db.with(move |conn| {
        conn.execute(
            "INSERT INTO butlers (name, description, endpoint_url)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET
                 description = excluded.description,
                 endpoint_url = coalesce(excluded.endpoint_url, butlers.endpoint_url)",
            rusqlite::params![name, description, endpoint],
        )
    })?;
    Ok(())
}

/// Record a liveness heartbeat; returns the butler's eligibility state.
/// Unknown butlers are admitted on first heartbeat.
pub fn record_heartbeat(db: &Db, name: &str) -> Result<String> {
    let now = Utc::now().to_rfc3339();
    let name_owned = name.to_string();
    db.with(move |conn| {
        conn.execute(
            "INSERT INTO butlers (name, last_heartbeat_at) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET last_heartbeat_at = excluded.last_heartbeat_at",
            rusqlite::params![name_owned, now],
        )?;
        conn.query_row(
            "SELECT eligibility_state FROM butlers WHERE name = ?1",
            [name_owned.as_str()],
            |row| row.get(0),
        )
    })
    .map_err(Into::into)
}

/// Butlers offered to the classifier, name-ordered for a stable prompt.
pub fn list_available_butlers(db: &Db) -> Result<Vec<ButlerEntry>> {
    Ok(db.with(|conn| {
        let mut stmt = conn.prepare(
            "SELECT name, description, eligibility_state, last_heartbeat_at
             FROM butlers
             WHERE eligibility_state = 'eligible'
             ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ButlerEntry {
                name: row.get(0)?,
                description: row.get(1)?,
                eligibility_state: row.get(2)?,
                last_heartbeat_at: row.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
    })?)
}

/// Render the catalog section of the routing prompt.
pub fn render_catalog(entries: &[ButlerEntry]) -> String {
    let mut out = String::from("## Available Butlers\n\n");
    for entry in entries {
        out.push_str(&format!("- **{}**: {}\n", entry.name, entry.description));
    }
    out
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
    fn upsert_list_and_heartbeat() {
        let db = db();
        upsert_butler(&db, "finance", "Budgets, invoices, and payments", None).unwrap();
        upsert_butler(&db, "travel", "Trips and bookings", Some("http://localhost:8204")).unwrap();

        let listed = list_available_butlers(&db).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "finance");
        assert!(listed[0].last_heartbeat_at.is_none());

        let state = record_heartbeat(&db, "finance").unwrap();
        assert_eq!(state, "eligible");
        let listed = list_available_butlers(&db).unwrap();
        assert!(listed[0].last_heartbeat_at.is_some());
    }

    #[test]
    fn first_heartbeat_admits_unknown_butler() {
        let db = db();
        let state = record_heartbeat(&db, "education").unwrap();
        assert_eq!(state, "eligible");
    }

    #[test]
    fn catalog_prompt_lists_names_and_descriptions() {
        let entries = vec![ButlerEntry {
            name: "health".into(),
            description: "Medication and appointments".into(),
            eligibility_state: "eligible".into(),
            last_heartbeat_at: None,
        }];
        let rendered = render_catalog(&entries);
        assert!(rendered.contains("- **health**: Medication and appointments"));
    }
}
