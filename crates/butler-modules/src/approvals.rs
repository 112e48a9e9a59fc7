use butler_db::Db;
use chrono::Utc;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;

/// Lifecycle of a tool call held for human approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Executed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Approved => "approved",
            ActionStatus::Rejected => "rejected",
            ActionStatus::Expired => "expired",
            ActionStatus::Executed => "executed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "approved" => ActionStatus::Approved,
            "rejected" => ActionStatus::Rejected,
            "expired" => ActionStatus::Expired,
            "executed" => ActionStatus::Executed,
            _ => ActionStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingAction {
    pub id: String,
    pub tool_name: String,
    pub args: Value,
    pub status: ActionStatus,
    pub requested_at: String,
    pub expires_at: Option<String>,
    pub decided_by: Option<String>,
    pub decided_at: Option<String>,
    pub execution_result: Option<Value>,
    pub approval_rule_id: Option<String>,
}

/// Approvals for sensitive tool calls: pending actions, standing rules with
/// usage budgets, and an append-only event trail (the table rejects UPDATE
/// and DELETE at the storage layer).
pub struct ApprovalStore {
    db: Db,
}

impl ApprovalStore {
    pub fn new(db: Db) -> Result<Self> {
        init_db(&db)?;
        Ok(Self { db })
    }

    /// Queue a tool call for approval. When an active rule matches the
    /// arguments, the action is auto-approved and the rule's use budget is
    /// spent.
    pub fn request(
        &self,
        tool_name: &str,
        args: &Value,
        expires_at: Option<&str>,
    ) -> Result<PendingAction> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let rule_id = self.consume_matching_rule(tool_name, args)?;
        let status = if rule_id.is_some() {
            ActionStatus::Approved
        } else {
            ActionStatus::Pending
        };

        let (id2, tool, args_json) = (id.clone(), tool_name.to_string(), args.to_string());
        let (now2, expires, rule) = (now.clone(), expires_at.map(str::to_string), rule_id.clone());
        let status_str = status.as_str();
        let decided_at = rule_id.as_ref().map(|_| now.clone());
        self.db.with(move |conn| {
            conn.execute(
                "INSERT INTO pending_actions
                 (id, tool_name, args, status, requested_at, expires_at,
                  decided_by, decided_at, approval_rule_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id2,
                    tool,
                    args_json,
                    status_str,
                    now2,
                    expires,
                    rule.as_ref().map(|_| "rule"),
                    decided_at,
                    rule
                ],
            )?;
            Ok(())
        })?;

        self.record_event(
            if rule_id.is_some() { "auto_approved" } else { "requested" },
            &serde_json::json!({"action_id": id, "tool": tool_name}),
        )?;
        self.get(&id).map(|a| a.expect("row just inserted"))
    }

    /// Human decision. Expired actions flip to `expired` instead.
    pub fn decide(&self, id: &str, approve: bool, decided_by: &str) -> Result<ActionStatus> {
        let Some(action) = self.get(id)? else {
            return Err(crate::error::ModuleError::Config(format!(
                "unknown pending action {id}"
            )));
        };
        if action.status != ActionStatus::Pending {
            return Ok(action.status);
        }
        let now = Utc::now().to_rfc3339();

        let new_status = if action
            .expires_at
            .as_deref()
            .is_some_and(|expiry| expiry < now.as_str())
        {
            ActionStatus::Expired
        } else if approve {
            ActionStatus::Approved
        } else {
            ActionStatus::Rejected
        };

        let (id2, by, now2) = (id.to_string(), decided_by.to_string(), now.clone());
        let status_str = new_status.as_str();
        self.db.with(move |conn| {
            conn.execute(
                "UPDATE pending_actions
                 SET status = ?1, decided_by = ?2, decided_at = ?3
                 WHERE id = ?4 AND status = 'pending'",
                rusqlite::params![status_str, by, now2, id2],
            )?;
            Ok(())
        })?;
        self.record_event(
            "decided",
            &serde_json::json!({"action_id": id, "status": new_status.as_str(), "by": decided_by}),
        )?;
        info!(action = id, status = new_status.as_str(), "approval decided");
        Ok(new_status)
    }

    /// Record the execution outcome of an approved action.
    pub fn mark_executed(&self, id: &str, result: &Value) -> Result<()> {
        let (id2, result_json) = (id.to_string(), result.to_string());
        let affected = self.db.with(move |conn| {
            conn.execute(
                "UPDATE pending_actions SET status = 'executed', execution_result = ?1
                 WHERE id = ?2 AND status = 'approved'",
                rusqlite::params![result_json, id2],
            )
        })?;
        if affected == 0 {
            return Err(crate::error::ModuleError::Config(format!(
                "action {id} is not in an executable state"
            )));
        }
        self.record_event("executed", &serde_json::json!({"action_id": id}))?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<PendingAction>> {
        let id = id.to_string();
        Ok(self.db.with(move |conn| {
            conn.query_row(
                "SELECT id, tool_name, args, status, requested_at, expires_at,
                        decided_by, decided_at, execution_result, approval_rule_id
                 FROM pending_actions WHERE id = ?1",
                [id.as_str()],
                row_to_action,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?)
    }

    /// Standing rule: auto-approve `tool_name` calls whose arguments contain
    /// every constraint key with an equal value.
    pub fn add_rule(
        &self,
        tool_name: &str,
        arg_constraints: &Value,
        description: &str,
        max_uses: Option<u32>,
        expires_at: Option<&str>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let (id2, tool, constraints) =
            (id.clone(), tool_name.to_string(), arg_constraints.to_string());
        let (desc, expires) = (description.to_string(), expires_at.map(str::to_string));
        self.db.with(move |conn| {
            conn.execute(
                "INSERT INTO approval_rules
                 (id, tool_name, arg_constraints, description, active, expires_at, max_uses,
                  use_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, 0, ?7)",
                rusqlite::params![id2, tool, constraints, desc, expires, max_uses, now],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Find an applicable active rule, spend one use, and return its id.
    fn consume_matching_rule(&self, tool_name: &str, args: &Value) -> Result<Option<String>> {
        let now = Utc::now().to_rfc3339();
        let tool = tool_name.to_string();
        let candidates: Vec<(String, String)> = self.db.with({
            let now = now.clone();
            move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, arg_constraints FROM approval_rules
                     WHERE tool_name = ?1 AND active = 1
                       AND (expires_at IS NULL OR expires_at > ?2)
                       AND (max_uses IS NULL OR use_count < max_uses)
                     ORDER BY created_at",
                )?;
                let rows = stmt.query_map(rusqlite::params![tool, now], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            }
        })?;

        for (rule_id, constraints_json) in candidates {
            let constraints: Value =
                serde_json::from_str(&constraints_json).unwrap_or(Value::Null);
            if constraints_match(&constraints, args) {
                let rule = rule_id.clone();
                self.db.with(move |conn| {
                    conn.execute(
                        "UPDATE approval_rules SET use_count = use_count + 1 WHERE id = ?1",
                        [rule.as_str()],
                    )?;
                    Ok(())
                })?;
                return Ok(Some(rule_id));
            }
        }
        Ok(None)
    }

    fn record_event(&self, kind: &str, payload: &Value) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let (kind, payload) = (kind.to_string(), payload.to_string());
        self.db.with(move |conn| {
            conn.execute(
                "INSERT INTO approval_events (kind, payload, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![kind, payload, now],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn db(&self) -> &Db {
        &self.db
    }
}

/// Every constraint key must be present in `args` with an equal value.
fn constraints_match(constraints: &Value, args: &Value) -> bool {
    match constraints.as_object() {
        Some(map) => map.iter().all(|(key, expected)| args.get(key) == Some(expected)),
        None => false,
    }
}

fn row_to_action(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingAction> {
    let args: String = row.get(2)?;
    let status: String = row.get(3)?;
    let execution_result: Option<String> = row.get(8)?;
    Ok(PendingAction {
        id: row.get(0)?,
        tool_name: row.get(1)?,
        args: serde_json::from_str(&args).unwrap_or(Value::Null),
        status: ActionStatus::parse(&status),
        requested_at: row.get(4)?,
        expires_at: row.get(5)?,
        decided_by: row.get(6)?,
        decided_at: row.get(7)?,
        execution_result: execution_result.and_then(|s| serde_json::from_str(&s).ok()),
        approval_rule_id: row.get(9)?,
    })
}

fn init_db(db: &Db) -> Result<()> {
    db.with(|conn| {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pending_actions (
                id               TEXT PRIMARY KEY,
                tool_name        TEXT NOT NULL,
                args             TEXT NOT NULL,
                status           TEXT NOT NULL DEFAULT 'pending',
                requested_at     TEXT NOT NULL,
                expires_at       TEXT,
                decided_by       TEXT,
                decided_at       TEXT,
                execution_result TEXT,
                approval_rule_id TEXT
            );

            CREATE TABLE IF NOT EXISTS approval_rules (
                id              TEXT PRIMARY KEY,
                tool_name       TEXT NOT NULL,
                arg_constraints TEXT NOT NULL DEFAULT '{}',
                description     TEXT NOT NULL DEFAULT '',
                active          INTEGER NOT NULL DEFAULT 1,
                expires_at      TEXT,
                max_uses        INTEGER,
                use_count       INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS approval_events (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                kind       TEXT NOT NULL,
                payload    TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TRIGGER IF NOT EXISTS approval_events_no_update
                BEFORE UPDATE ON approval_events
            BEGIN
                SELECT RAISE(ABORT, 'approval_events is append-only');
            END;
            CREATE TRIGGER IF NOT EXISTS approval_events_no_delete
                BEFORE DELETE ON approval_events
            BEGIN
                SELECT RAISE(ABORT, 'approval_events is append-only');
            END;",
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ApprovalStore {
        ApprovalStore::new(Db::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn request_then_approve_then_execute() {
        let store = store();
        let action = store
            .request("messenger_send", &json!({"to": "anna"}), None)
            .unwrap();
        assert_eq!(action.status, ActionStatus::Pending);

        let status = store.decide(&action.id, true, "operator").unwrap();
        assert_eq!(status, ActionStatus::Approved);

        store.mark_executed(&action.id, &json!({"sent": true})).unwrap();
        let done = store.get(&action.id).unwrap().unwrap();
        assert_eq!(done.status, ActionStatus::Executed);
        assert_eq!(done.execution_result.unwrap()["sent"], true);
    }

    #[test]
    fn rejection_blocks_execution() {
        let store = store();
        let action = store.request("messenger_send", &json!({}), None).unwrap();
        store.decide(&action.id, false, "operator").unwrap();
        assert!(store.mark_executed(&action.id, &json!({})).is_err());
    }

    #[test]
    fn expired_action_cannot_be_approved() {
        let store = store();
        let action = store
            .request("messenger_send", &json!({}), Some("2000-01-01T00:00:00+00:00"))
            .unwrap();
        let status = store.decide(&action.id, true, "operator").unwrap();
        assert_eq!(status, ActionStatus::Expired);
    }

    #[test]
    fn matching_rule_auto_approves_until_budget_spent() {
        let store = store();
        store
            .add_rule(
                "messenger_send",
                &json!({"to": "anna"}),
                "anna is always fine",
                Some(2),
                None,
            )
            .unwrap();

        for _ in 0..2 {
            let action = store
                .request("messenger_send", &json!({"to": "anna", "text": "hi"}), None)
                .unwrap();
            assert_eq!(action.status, ActionStatus::Approved);
            assert!(action.approval_rule_id.is_some());
        }
        // Budget spent: third request waits for a human.
        let third = store
            .request("messenger_send", &json!({"to": "anna"}), None)
            .unwrap();
        assert_eq!(third.status, ActionStatus::Pending);
    }

    #[test]
    fn rule_constraints_must_all_match() {
        let store = store();
        store
            .add_rule("messenger_send", &json!({"to": "anna"}), "", None, None)
            .unwrap();
        let other = store
            .request("messenger_send", &json!({"to": "bob"}), None)
            .unwrap();
        assert_eq!(other.status, ActionStatus::Pending);
    }

    #[test]
    fn approval_events_are_append_only() {
        let store = store();
        store.request("messenger_send", &json!({}), None).unwrap();
        assert!(store
            .db()
            .with(|conn| conn.execute("UPDATE approval_events SET kind = 'x'", []))
            .is_err());
        assert!(store
            .db()
            .with(|conn| conn.execute("DELETE FROM approval_events", []))
            .is_err());
    }
}
