use butler_core::config::{ScheduleEntry, ScheduleSpec};
use butler_db::Db;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::schedule::compute_next_run;

/// A schedule whose time has arrived, forwarded to the daemon for dispatch.
#[derive(Debug, Clone)]
pub struct FiredSchedule {
    pub name: String,
    pub prompt: String,
}

impl FiredSchedule {
    /// `trigger_source` value handed to the spawner.
    pub fn trigger_source(&self) -> String {
        format!("schedule:{}", self.name)
    }
}

fn init_db(db: &Db) -> Result<()> {
    db.with(|conn| {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schedules (
                name       TEXT PRIMARY KEY,
                spec       TEXT NOT NULL,
                prompt     TEXT NOT NULL,
                last_run   TEXT,
                next_run   TEXT,
                run_count  INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
    })?;
    Ok(())
}

/// Reconcile butler.toml schedule entries into the durable store.
///
/// New entries are inserted with a computed `next_run`; changed entries are
/// updated (and re-planned); rows whose config entry disappeared are removed.
/// Run counters and last_run survive restarts for unchanged entries.
pub fn sync_schedules(db: &Db, entries: &[ScheduleEntry]) -> Result<usize> {
    init_db(db)?;
    let now = Utc::now();
    let now_str = now.to_rfc3339();
    let mut changed = 0usize;

    for entry in entries {
        let spec_json = serde_json::to_string(&entry.schedule)
            .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;
        let next = compute_next_run(&entry.schedule, now).map(|dt| dt.to_rfc3339());

        let existing: Option<String> = db.with(|conn| {
            conn.query_row(
                "SELECT spec FROM schedules WHERE name = ?1",
                [entry.name.as_str()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;

        match existing {
            None => {
                db.with(|conn| {
                    conn.execute(
                        "INSERT INTO schedules (name, spec, prompt, next_run, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                        rusqlite::params![entry.name, spec_json, entry.prompt, next, now_str],
                    )
                })?;
                info!(schedule = %entry.name, "schedule added");
                changed += 1;
            }
            Some(stored_spec) if stored_spec != spec_json => {
                db.with(|conn| {
                    conn.execute(
                        "UPDATE schedules
                         SET spec = ?1, prompt = ?2, next_run = ?3, updated_at = ?4
                         WHERE name = ?5",
                        rusqlite::params![spec_json, entry.prompt, next, now_str, entry.name],
                    )
                })?;
                info!(schedule = %entry.name, "schedule updated");
                changed += 1;
            }
            Some(_) => {
                // Spec unchanged; refresh the prompt text only.
                db.with(|conn| {
                    conn.execute(
                        "UPDATE schedules SET prompt = ?1, updated_at = ?2 WHERE name = ?3",
                        rusqlite::params![entry.prompt, now_str, entry.name],
                    )
                })?;
            }
        }
    }

    // Remove rows with no surviving config entry.
    let keep: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
    let removed = db.with(|conn| {
        let mut stmt = conn.prepare("SELECT name FROM schedules")?;
        let names: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        let mut removed = 0usize;
        for name in names {
            if !keep.contains(&name) {
                removed += conn.execute("DELETE FROM schedules WHERE name = ?1", [name.as_str()])?;
            }
        }
        Ok(removed)
    })?;
    if removed > 0 {
        info!(removed, "stale schedules removed");
    }
    Ok(changed + removed)
}

/// Polls the schedules table and fires due entries at ±1 s precision.
pub struct SchedulerEngine {
    db: Db,
    fired_tx: mpsc::Sender<FiredSchedule>,
}

impl SchedulerEngine {
    pub fn new(db: Db, fired_tx: mpsc::Sender<FiredSchedule>) -> Result<Self> {
        init_db(&db)?;
        Ok(Self { db, fired_tx })
    }

    /// Main loop. Polls every second until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler engine started");
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick() {
                        error!("scheduler tick error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Fire every schedule whose next_run has arrived and re-plan it.
    pub fn tick(&self) -> Result<()> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        let due: Vec<(String, String, String, u32)> = self.db.with(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT name, spec, prompt, run_count FROM schedules
                 WHERE next_run IS NOT NULL AND next_run <= ?1",
            )?;
            let rows: Vec<_> = stmt
                .query_map([&now_str], |row| {
                    Ok((
                        row.get::<_, String>(0)?, // name
                        row.get::<_, String>(1)?, // spec JSON
                        row.get::<_, String>(2)?, // prompt
                        row.get::<_, u32>(3)?,    // run_count
                    ))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        for (name, spec_json, prompt, run_count) in due {
            let spec: ScheduleSpec = match serde_json::from_str(&spec_json) {
                Ok(s) => s,
                Err(e) => {
                    error!(schedule = %name, "bad schedule spec JSON: {e}");
                    continue;
                }
            };
            let next = compute_next_run(&spec, now).map(|dt| dt.to_rfc3339());

            info!(schedule = %name, run = run_count + 1, "schedule fired");
            self.db.with(|conn| {
                conn.execute(
                    "UPDATE schedules
                     SET last_run = ?1, next_run = ?2, run_count = run_count + 1, updated_at = ?1
                     WHERE name = ?3",
                    rusqlite::params![now_str, next, name],
                )
            })?;

            // try_send never stalls the tick loop.
            if self
                .fired_tx
                .try_send(FiredSchedule {
                    name: name.clone(),
                    prompt,
                })
                .is_err()
            {
                warn!(schedule = %name, "dispatch channel full or closed — firing dropped");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, every_secs: u64) -> ScheduleEntry {
        ScheduleEntry {
            name: name.to_string(),
            schedule: ScheduleSpec::Interval { every_secs },
            prompt: format!("run {name}"),
        }
    }

    #[test]
    fn sync_inserts_updates_and_removes() {
        let db = Db::open_in_memory().unwrap();
        assert_eq!(sync_schedules(&db, &[entry("brief", 60)]).unwrap(), 1);
        // Unchanged spec: no structural change.
        assert_eq!(sync_schedules(&db, &[entry("brief", 60)]).unwrap(), 0);
        // Changed spec counts as a change.
        assert_eq!(sync_schedules(&db, &[entry("brief", 120)]).unwrap(), 1);
        // Dropped from config: removed.
        assert_eq!(sync_schedules(&db, &[]).unwrap(), 1);
        let count: i64 = db
            .with(|conn| conn.query_row("SELECT count(*) FROM schedules", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn due_schedule_fires_and_replans() {
        let db = Db::open_in_memory().unwrap();
        sync_schedules(&db, &[entry("pulse", 3600)]).unwrap();
        // Force the schedule due.
        db.with(|conn| {
            conn.execute(
                "UPDATE schedules SET next_run = '2000-01-01T00:00:00+00:00'",
                [],
            )
        })
        .unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let engine = SchedulerEngine::new(db.clone(), tx).unwrap();
        engine.tick().unwrap();

        let fired = rx.try_recv().unwrap();
        assert_eq!(fired.name, "pulse");
        assert_eq!(fired.prompt, "run pulse");
        assert_eq!(fired.trigger_source(), "schedule:pulse");

        let (next_run, run_count): (Option<String>, u32) = db
            .with(|conn| {
                conn.query_row(
                    "SELECT next_run, run_count FROM schedules WHERE name = 'pulse'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
            })
            .unwrap();
        assert_eq!(run_count, 1);
        assert!(next_run.unwrap() > Utc::now().to_rfc3339());
    }

    #[test]
    fn future_schedule_does_not_fire() {
        let db = Db::open_in_memory().unwrap();
        sync_schedules(&db, &[entry("later", 3600)]).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let engine = SchedulerEngine::new(db, tx).unwrap();
        engine.tick().unwrap();
        assert!(rx.try_recv().is_err());
    }
}
