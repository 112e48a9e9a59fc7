use butler_db::{Chain, Db, Migration};
use chrono::{DateTime, Datelike, Utc};

use crate::error::Result;

/// Switchboard schema as one migration chain.
///
/// The original deployment partitioned `message_inbox` by `received_at` week
/// in Postgres; under SQLite that collapses to a single table plus a per-week
/// covering index created on demand by [`ensure_week_partition`].
pub const SWITCHBOARD_CHAIN: Chain = Chain {
    name: "switchboard",
    migrations: &[
        Migration {
            revision: "sw_001",
            down_revision: None,
            up_sql: "
                CREATE TABLE IF NOT EXISTS message_inbox (
                    id                  TEXT PRIMARY KEY,
                    received_at         TEXT NOT NULL,
                    received_week       TEXT NOT NULL,
                    request_context     TEXT NOT NULL,
                    raw_payload         TEXT,
                    normalized_text     TEXT NOT NULL,
                    attachments         TEXT NOT NULL DEFAULT '[]',
                    lifecycle_state     TEXT NOT NULL DEFAULT 'accepted',
                    schema_version      TEXT NOT NULL DEFAULT 'ingest.v1',
                    processing_metadata TEXT NOT NULL DEFAULT '{}',
                    created_at          TEXT NOT NULL,
                    updated_at          TEXT NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_inbox_dedupe_key
                    ON message_inbox(json_extract(request_context, '$.dedupe_key'));
                CREATE INDEX IF NOT EXISTS idx_inbox_thread
                    ON message_inbox(
                        json_extract(request_context, '$.source_channel'),
                        json_extract(request_context, '$.source_thread_identity'),
                        received_at
                    );
            ",
            down_sql: "DROP TABLE IF EXISTS message_inbox;",
        },
        Migration {
            revision: "sw_002",
            down_revision: Some("sw_001"),
            up_sql: "
                CREATE TABLE IF NOT EXISTS route_inbox (
                    message_inbox_id TEXT NOT NULL UNIQUE,
                    butler_name      TEXT NOT NULL,
                    request_id       TEXT NOT NULL,
                    payload          TEXT NOT NULL,
                    enqueued_at      TEXT NOT NULL,
                    lease_owner      TEXT,
                    lease_expires_at TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_route_inbox_lease
                    ON route_inbox(lease_expires_at, enqueued_at);

                CREATE TABLE IF NOT EXISTS ingress_dedupe (
                    dedupe_key   TEXT PRIMARY KEY,
                    processed_at TEXT NOT NULL
                );
            ",
            down_sql: "
                DROP TABLE IF EXISTS ingress_dedupe;
                DROP TABLE IF EXISTS route_inbox;
            ",
        },
        Migration {
            revision: "sw_003",
            down_revision: Some("sw_002"),
            up_sql: "
                CREATE TABLE IF NOT EXISTS triage_rules (
                    id         INTEGER PRIMARY KEY AUTOINCREMENT,
                    priority   INTEGER NOT NULL,
                    rule_type  TEXT NOT NULL,
                    condition  TEXT NOT NULL,
                    action     TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS thread_affinity (
                    thread_key  TEXT PRIMARY KEY,
                    butler_name TEXT NOT NULL,
                    updated_at  TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS butlers (
                    name              TEXT PRIMARY KEY,
                    description       TEXT NOT NULL DEFAULT '',
                    endpoint_url      TEXT,
                    last_heartbeat_at TEXT,
                    eligibility_state TEXT NOT NULL DEFAULT 'eligible'
                );
            ",
            down_sql: "
                DROP TABLE IF EXISTS butlers;
                DROP TABLE IF EXISTS thread_affinity;
                DROP TABLE IF EXISTS triage_rules;
            ",
        },
        Migration {
            revision: "sw_004",
            down_revision: Some("sw_003"),
            up_sql: "
                CREATE TABLE IF NOT EXISTS delivery_request (
                    id            TEXT PRIMARY KEY,
                    channel       TEXT NOT NULL,
                    recipient     TEXT NOT NULL,
                    payload       TEXT NOT NULL,
                    status        TEXT NOT NULL DEFAULT 'pending',
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    created_at    TEXT NOT NULL,
                    updated_at    TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS delivery_attempt (
                    id         INTEGER PRIMARY KEY AUTOINCREMENT,
                    request_id TEXT NOT NULL,
                    outcome    TEXT NOT NULL,
                    detail     TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS delivery_receipt (
                    id           INTEGER PRIMARY KEY AUTOINCREMENT,
                    request_id   TEXT NOT NULL,
                    receipt_type TEXT NOT NULL,
                    detail       TEXT,
                    created_at   TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS delivery_dead_letter (
                    request_id      TEXT PRIMARY KEY,
                    envelope        TEXT NOT NULL,
                    reason          TEXT NOT NULL,
                    replay_eligible INTEGER NOT NULL DEFAULT 1,
                    created_at      TEXT NOT NULL
                );
            ",
            down_sql: "
                DROP TABLE IF EXISTS delivery_dead_letter;
                DROP TABLE IF EXISTS delivery_receipt;
                DROP TABLE IF EXISTS delivery_attempt;
                DROP TABLE IF EXISTS delivery_request;
            ",
        },
    ],
};

/// ISO-week partition label for a timestamp, e.g. `2026W27`.
pub fn week_label(ts: DateTime<Utc>) -> String {
    let week = ts.iso_week();
    format!("{}W{:02}", week.year(), week.week())
}

/// Keep the weekly-partition seam from the original deployment: make sure the
/// covering index for this week exists. Idempotent and cheap.
pub fn ensure_week_partition(db: &Db, received_at: DateTime<Utc>) -> Result<()> {
    let label = week_label(received_at);
    let index_name = format!("idx_inbox_week_{}", label.to_lowercase());
    db.with(move |conn| {
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS {index_name}
                 ON message_inbox(received_at)
                 WHERE received_week = '{label}';"
        ))
    })?;
    Ok(())
}
