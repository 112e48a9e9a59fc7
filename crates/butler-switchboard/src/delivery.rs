use butler_db::Db;
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, SwitchboardError};

/// Outbound request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    InProgress,
    Delivered,
    Failed,
    DeadLettered,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::InProgress => "in_progress",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::DeadLettered => "dead_lettered",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "in_progress" => DeliveryStatus::InProgress,
            "delivered" => DeliveryStatus::Delivered,
            "failed" => DeliveryStatus::Failed,
            "dead_lettered" => DeliveryStatus::DeadLettered,
            _ => DeliveryStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    RetryableError,
    NonRetryableError,
    Timeout,
    InProgress,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::RetryableError => "retryable_error",
            AttemptOutcome::NonRetryableError => "non_retryable_error",
            AttemptOutcome::Timeout => "timeout",
            AttemptOutcome::InProgress => "in_progress",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptType {
    Sent,
    Delivered,
    Read,
    WebhookConfirmation,
}

impl ReceiptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptType::Sent => "sent",
            ReceiptType::Delivered => "delivered",
            ReceiptType::Read => "read",
            ReceiptType::WebhookConfirmation => "webhook_confirmation",
        }
    }
}

/// Outbound messenger state machine over the delivery tables.
///
/// `pending → in_progress → delivered | failed → dead_lettered`; retryable
/// outcomes return the request to `pending` until `max_attempts` is spent.
pub struct DeliveryTracker {
    db: Db,
    max_attempts: u32,
}

impl DeliveryTracker {
    pub fn new(db: Db, max_attempts: u32) -> Self {
        Self {
            db,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn create_request(&self, channel: &str, recipient: &str, payload: &Value) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let now = Utc::now().to_rfc3339();
        let (id_str, channel, recipient, payload) = (
            id.to_string(),
            channel.to_string(),
            recipient.to_string(),
            payload.to_string(),
        );
        self.db.with(move |conn| {
            conn.execute(
                "INSERT INTO delivery_request (id, channel, recipient, payload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                rusqlite::params![id_str, channel, recipient, payload, now],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn status(&self, request_id: Uuid) -> Result<Option<DeliveryStatus>> {
        let id = request_id.to_string();
        let found: Option<String> = self.db.with(move |conn| {
            conn.query_row(
                "SELECT status FROM delivery_request WHERE id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        Ok(found.map(|s| DeliveryStatus::parse(&s)))
    }

    /// Record one delivery attempt and advance the request state machine.
    /// Returns the new status.
    pub fn record_attempt(
        &self,
        request_id: Uuid,
        outcome: AttemptOutcome,
        detail: Option<&str>,
    ) -> Result<DeliveryStatus> {
        let now = Utc::now().to_rfc3339();
        let id = request_id.to_string();

        let (payload, attempt_count): (String, u32) = self
            .db
            .with({
                let id = id.clone();
                move |conn| {
                    conn.query_row(
                        "SELECT payload, attempt_count FROM delivery_request WHERE id = ?1",
                        [id.as_str()],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                }
            })
            .map_err(|_| {
                SwitchboardError::Validation(format!("unknown delivery request {request_id}"))
            })?;

        let attempts_now = attempt_count + 1;
        let new_status = match outcome {
            AttemptOutcome::Success => DeliveryStatus::Delivered,
            AttemptOutcome::InProgress => DeliveryStatus::InProgress,
            AttemptOutcome::RetryableError | AttemptOutcome::Timeout => {
                if attempts_now >= self.max_attempts {
                    DeliveryStatus::DeadLettered
                } else {
                    DeliveryStatus::Pending
                }
            }
            AttemptOutcome::NonRetryableError => DeliveryStatus::DeadLettered,
        };

        let counts_as_attempt = outcome != AttemptOutcome::InProgress;
        let (outcome_str, detail_owned) = (outcome.as_str(), detail.map(str::to_string));
        self.db.with({
            let (id, now) = (id.clone(), now.clone());
            move |conn| {
                let tx = conn.unchecked_transaction()?;
                tx.execute(
                    "INSERT INTO delivery_attempt (request_id, outcome, detail, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, outcome_str, detail_owned, now],
                )?;
                tx.execute(
                    "UPDATE delivery_request
                     SET status = ?1, attempt_count = attempt_count + ?2, updated_at = ?3
                     WHERE id = ?4",
                    rusqlite::params![
                        new_status.as_str(),
                        counts_as_attempt as i32,
                        now,
                        id
                    ],
                )?;
                tx.commit()
            }
        })?;

        if new_status == DeliveryStatus::DeadLettered {
            self.dead_letter(request_id, &payload, detail.unwrap_or("delivery failed"))?;
            // Terminal failure passes through `failed` semantically; the row
            // records the dead-letter state which implies it.
            warn!(request_id = %request_id, "delivery request dead-lettered");
        } else {
            info!(request_id = %request_id, status = new_status.as_str(), "delivery attempt recorded");
        }
        Ok(new_status)
    }

    pub fn record_receipt(
        &self,
        request_id: Uuid,
        receipt_type: ReceiptType,
        detail: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let (id, kind, detail) = (
            request_id.to_string(),
            receipt_type.as_str(),
            detail.map(str::to_string),
        );
        self.db.with(move |conn| {
            conn.execute(
                "INSERT INTO delivery_receipt (request_id, receipt_type, detail, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, kind, detail, now],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn dead_letter(&self, request_id: Uuid, envelope: &str, reason: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let (id, envelope, reason) = (
            request_id.to_string(),
            envelope.to_string(),
            reason.to_string(),
        );
        self.db.with(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO delivery_dead_letter
                 (request_id, envelope, reason, replay_eligible, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                rusqlite::params![id, envelope, reason, now],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Dead-letter rows still eligible for replay, oldest first.
    pub fn replayable_dead_letters(&self) -> Result<Vec<(Uuid, Value)>> {
        let rows: Vec<(String, String)> = self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT request_id, envelope FROM delivery_dead_letter
                 WHERE replay_eligible = 1 ORDER BY created_at",
            )?;
            let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, envelope)| {
                let id = Uuid::parse_str(&id).ok()?;
                let envelope = serde_json::from_str(&envelope).ok()?;
                Some((id, envelope))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SWITCHBOARD_CHAIN;
    use butler_db::run_migrations;
    use serde_json::json;

    fn tracker() -> DeliveryTracker {
        let db = Db::open_in_memory().unwrap();
        run_migrations(&db, &SWITCHBOARD_CHAIN).unwrap();
        DeliveryTracker::new(db, 3)
    }

    #[test]
    fn success_path_reaches_delivered() {
        let tracker = tracker();
        let id = tracker
            .create_request("telegram", "user-1", &json!({"text": "done!"}))
            .unwrap();
        assert_eq!(tracker.status(id).unwrap().unwrap(), DeliveryStatus::Pending);

        tracker.record_attempt(id, AttemptOutcome::InProgress, None).unwrap();
        assert_eq!(
            tracker.status(id).unwrap().unwrap(),
            DeliveryStatus::InProgress
        );

        let status = tracker.record_attempt(id, AttemptOutcome::Success, None).unwrap();
        assert_eq!(status, DeliveryStatus::Delivered);

        tracker.record_receipt(id, ReceiptType::Read, Some("seen 10:03")).unwrap();
    }

    #[test]
    fn retryable_errors_return_to_pending_until_budget_spent() {
        let tracker = tracker();
        let id = tracker
            .create_request("whatsapp", "user-2", &json!({"text": "hello"}))
            .unwrap();

        assert_eq!(
            tracker
                .record_attempt(id, AttemptOutcome::RetryableError, Some("503"))
                .unwrap(),
            DeliveryStatus::Pending
        );
        assert_eq!(
            tracker
                .record_attempt(id, AttemptOutcome::Timeout, Some("30s"))
                .unwrap(),
            DeliveryStatus::Pending
        );
        // Third attempt exhausts max_attempts = 3.
        assert_eq!(
            tracker
                .record_attempt(id, AttemptOutcome::RetryableError, Some("503"))
                .unwrap(),
            DeliveryStatus::DeadLettered
        );

        let dead = tracker.replayable_dead_letters().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0, id);
        assert_eq!(dead[0].1["text"], "hello");
    }

    #[test]
    fn non_retryable_error_dead_letters_immediately() {
        let tracker = tracker();
        let id = tracker
            .create_request("email", "x@y.com", &json!({"subject": "hi"}))
            .unwrap();
        let status = tracker
            .record_attempt(id, AttemptOutcome::NonRetryableError, Some("bad recipient"))
            .unwrap();
        assert_eq!(status, DeliveryStatus::DeadLettered);
        assert_eq!(tracker.replayable_dead_letters().unwrap().len(), 1);
    }

    #[test]
    fn unknown_request_is_a_validation_error() {
        let tracker = tracker();
        assert!(tracker
            .record_attempt(Uuid::now_v7(), AttemptOutcome::Success, None)
            .is_err());
    }
}
