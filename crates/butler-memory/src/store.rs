use butler_db::{run_migrations, Db};
use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::db::MEMORY_CHAIN;
use crate::error::{MemoryError, Result};
use crate::types::{Fact, MemoryKind, MemoryRecord, Permanence, Validity};

/// Memory storage for one butler database.
///
/// Entity ids are v4 UUIDs (memory items are not time-ordered); session ids
/// arriving from the spawner are v7 and stored opaquely.
pub struct MemoryStore {
    db: Db,
    tenant_id: String,
}

impl MemoryStore {
    pub fn new(db: Db) -> Result<Self> {
        run_migrations(&db, &MEMORY_CHAIN)?;
        Ok(Self {
            db,
            tenant_id: "default".to_string(),
        })
    }

    pub fn with_tenant(mut self, tenant_id: &str) -> Self {
        self.tenant_id = tenant_id.to_string();
        self
    }

    /// Store a session episode. Returns the new episode id.
    pub fn store_episode(
        &self,
        content: &str,
        source_butler: &str,
        session_id: Option<&str>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let tenant = self.tenant_id.clone();
        let (id2, content2) = (id.clone(), content.to_string());
        let (butler, session) = (source_butler.to_string(), session_id.map(str::to_string));
        self.db.with(move |conn| {
            conn.execute(
                "INSERT INTO episodes (id, tenant_id, content, source_butler, session_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id2, tenant, content2, butler, session, now],
            )?;
            conn.execute(
                "INSERT INTO memory_fts (item_id, kind, content) VALUES (?1, 'episode', ?2)",
                rusqlite::params![id2, content2],
            )?;
            Ok(())
        })?;
        self.record_event("episode_stored", &serde_json::json!({"id": id}))?;
        Ok(id)
    }

    /// Store a fact, superseding any active fact with the same
    /// `(subject, predicate, scope)`.
    ///
    /// Supersession is atomic and produces exactly three writes: the old row
    /// flips to `superseded`, the new row lands with `supersedes_id`, and one
    /// `memory_links` row records the relation.
    pub fn store_fact(
        &self,
        subject: &str,
        predicate: &str,
        content: &str,
        scope: &str,
        permanence: Permanence,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let tenant = self.tenant_id.clone();
        let (id2, content2) = (id.clone(), content.to_string());
        let (subject, predicate, scope) =
            (subject.to_string(), predicate.to_string(), scope.to_string());

        let superseded: Option<String> = self.db.with(move |conn| {
            let tx = conn.unchecked_transaction()?;

            let prior: Option<String> = tx
                .query_row(
                    "SELECT id FROM facts
                     WHERE subject = ?1 AND predicate = ?2 AND scope = ?3 AND validity = 'active'",
                    rusqlite::params![subject, predicate, scope],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            if let Some(ref prior_id) = prior {
                tx.execute(
                    "UPDATE facts SET validity = 'superseded', updated_at = ?1 WHERE id = ?2",
                    rusqlite::params![now, prior_id],
                )?;
            }
            tx.execute(
                "INSERT INTO facts
                 (id, tenant_id, subject, predicate, content, scope, permanence, decay_rate,
                  validity, supersedes_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'active', ?9, ?10, ?10)",
                rusqlite::params![
                    id2,
                    tenant,
                    subject,
                    predicate,
                    content2,
                    scope,
                    permanence.as_str(),
                    permanence.decay_rate(),
                    prior,
                    now
                ],
            )?;
            if let Some(ref prior_id) = prior {
                tx.execute(
                    "INSERT INTO memory_links (source_id, target_id, relation, created_at)
                     VALUES (?1, ?2, 'supersedes', ?3)",
                    rusqlite::params![id2, prior_id, now],
                )?;
            }
            tx.execute(
                "INSERT INTO memory_fts (item_id, kind, content) VALUES (?1, 'fact', ?2)",
                rusqlite::params![id2, content2],
            )?;

            tx.commit()?;
            Ok(prior)
        })?;

        if let Some(prior) = superseded {
            debug!(fact = %id, superseded = %prior, "fact superseded");
        }
        self.record_event("fact_stored", &serde_json::json!({"id": id}))?;
        Ok(id)
    }

    pub fn store_rule(&self, content: &str, scope: &str, metadata: &Value) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let tenant = self.tenant_id.clone();
        let (id2, content2) = (id.clone(), content.to_string());
        let (scope, meta) = (scope.to_string(), metadata.to_string());
        self.db.with(move |conn| {
            conn.execute(
                "INSERT INTO rules (id, tenant_id, content, scope, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id2, tenant, content2, scope, meta, now],
            )?;
            Ok(())
        })?;
        self.record_event("rule_stored", &serde_json::json!({"id": id}))?;
        Ok(id)
    }

    /// Fetch a memory item, atomically bumping `reference_count` and setting
    /// `last_referenced_at = now()`. Returns the updated row, or None.
    pub fn get_memory(&self, kind: MemoryKind, id: &str) -> Result<Option<MemoryRecord>> {
        let now = Utc::now().to_rfc3339();
        let table = kind.table();
        let id = id.to_string();
        let record = self.db.with(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let touched = tx.execute(
                &format!(
                    "UPDATE {table}
                     SET reference_count = reference_count + 1, last_referenced_at = ?1
                     WHERE id = ?2"
                ),
                rusqlite::params![now, id],
            )?;
            if touched == 0 {
                tx.commit()?;
                return Ok(None);
            }
            let record = tx.query_row(
                &format!(
                    "SELECT id, content, reference_count, last_referenced_at FROM {table}
                     WHERE id = ?1"
                ),
                [id.as_str()],
                |row| {
                    Ok(MemoryRecord {
                        id: row.get(0)?,
                        kind: kind.as_str(),
                        content: row.get(1)?,
                        reference_count: row.get(2)?,
                        last_referenced_at: row.get(3)?,
                    })
                },
            )?;
            tx.commit()?;
            Ok(Some(record))
        })?;
        Ok(record)
    }

    /// Soft-delete semantics vary per kind:
    /// episode → `expires_at = now`; fact → `validity = 'retracted'`;
    /// rule → merge `{"forgotten": true}` into metadata.
    pub fn forget_memory(&self, kind: MemoryKind, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let id_owned = id.to_string();
        let affected = match kind {
            MemoryKind::Episode => self.db.with(move |conn| {
                conn.execute(
                    "UPDATE episodes SET expires_at = ?1 WHERE id = ?2",
                    rusqlite::params![now, id_owned],
                )
            })?,
            MemoryKind::Fact => self.db.with(move |conn| {
                conn.execute(
                    "UPDATE facts SET validity = 'retracted', updated_at = ?1 WHERE id = ?2",
                    rusqlite::params![now, id_owned],
                )
            })?,
            MemoryKind::Rule => self.db.with(move |conn| {
                conn.execute(
                    "UPDATE rules
                     SET metadata = json_set(metadata, '$.forgotten', json('true'))
                     WHERE id = ?1",
                    [id_owned.as_str()],
                )
            })?,
        };
        if affected == 0 {
            return Err(MemoryError::NotFound {
                kind: kind.as_str().to_string(),
                id: id.to_string(),
            });
        }
        self.record_event(
            "memory_forgotten",
            &serde_json::json!({"kind": kind.as_str(), "id": id}),
        )?;
        Ok(())
    }

    /// Typed relation between two memory items.
    pub fn link(&self, source_id: &str, target_id: &str, relation: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let (s, t, r) = (source_id.to_string(), target_id.to_string(), relation.to_string());
        self.db.with(move |conn| {
            conn.execute(
                "INSERT INTO memory_links (source_id, target_id, relation, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![s, t, r, now],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn get_fact(&self, id: &str) -> Result<Option<Fact>> {
        let id = id.to_string();
        Ok(self.db.with(move |conn| {
            conn.query_row(
                "SELECT id, subject, predicate, content, scope, permanence, validity,
                        supersedes_id, reference_count, last_referenced_at, created_at
                 FROM facts WHERE id = ?1",
                [id.as_str()],
                row_to_fact,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?)
    }

    /// Append to the tenant-keyed audit trail. The table rejects UPDATE and
    /// DELETE via triggers.
    pub fn record_event(&self, kind: &str, payload: &Value) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let tenant = self.tenant_id.clone();
        let (kind, payload) = (kind.to_string(), payload.to_string());
        self.db.with(move |conn| {
            conn.execute(
                "INSERT INTO memory_events (tenant_id, kind, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![tenant, kind, payload, now],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn db(&self) -> &Db {
        &self.db
    }
}

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    let permanence: String = row.get(5)?;
    let validity: String = row.get(6)?;
    Ok(Fact {
        id: row.get(0)?,
        subject: row.get(1)?,
        predicate: row.get(2)?,
        content: row.get(3)?,
        scope: row.get(4)?,
        permanence: permanence.parse().unwrap_or(Permanence::Standard),
        validity: match validity.as_str() {
            "superseded" => Validity::Superseded,
            "retracted" => Validity::Retracted,
            _ => Validity::Active,
        },
        supersedes_id: row.get(7)?,
        reference_count: row.get(8)?,
        last_referenced_at: row.get(9)?,
        created_at: row.get(10)?,
    })
}
