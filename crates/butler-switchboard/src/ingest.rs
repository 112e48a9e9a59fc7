use butler_db::Db;
use butler_protocol::envelope::{
    parse_ingest_envelope, IngestAcceptedResponse, IngestEnvelopeV1, IngestionTier,
    RequestContext, TriageAnnotation,
};
use butler_telemetry::ButlerMetrics;
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::affinity::{lookup_thread_affinity, ThreadAffinitySettings};
use crate::db::{ensure_week_partition, week_label};
use crate::dedupe::compute_dedupe_key;
use crate::error::{Result, SwitchboardError};
use crate::triage::{evaluate_triage, make_triage_envelope, Decision, TriageDecision, TriageRule};

/// Canonical ingest boundary for connector submissions.
///
/// Validates the `ingest.v1` envelope, computes the dedupe key, runs
/// deterministic triage, persists the `message_inbox` row, and returns the
/// canonical request reference. Duplicate submissions return the original
/// `request_id` with `duplicate = true` and no triage annotation.
///
/// `triage_rules = None` means the caller skipped triage entirely (legacy
/// mode); `triage_cache_available = false` records a pass-through with reason
/// `cache_unavailable`.
pub fn ingest_v1(
    db: &Db,
    payload: &serde_json::Value,
    triage_rules: Option<&[TriageRule]>,
    triage_cache_available: bool,
    thread_affinity_settings: Option<&ThreadAffinitySettings>,
    enable_thread_affinity: bool,
    metrics: Option<&ButlerMetrics>,
) -> Result<IngestAcceptedResponse> {
    // 1. Validate.
    let envelope = parse_ingest_envelope(payload)?;

    // 2. Dedupe key.
    let dedupe = compute_dedupe_key(&envelope);

    // 3. Duplicate short-circuit.
    if let Some(existing) = find_request_by_dedupe_key(db, &dedupe.key)? {
        debug!(dedupe_key = %dedupe.key, request_id = %existing, "duplicate submission");
        if let Some(m) = metrics {
            m.dedupe_accepted_inc();
        }
        return Ok(IngestAcceptedResponse::accepted(existing, true));
    }

    // 4. Thread affinity (email only, when enabled).
    let affinity_target = if enable_thread_affinity && envelope.source.channel == "email" {
        match envelope.event.external_thread_id {
            Some(ref thread_id) => {
                let default_settings = ThreadAffinitySettings::default();
                let settings = thread_affinity_settings.unwrap_or(&default_settings);
                lookup_thread_affinity(
                    db,
                    &envelope.source.channel,
                    &envelope.source.endpoint_identity,
                    thread_id,
                    settings,
                )?
            }
            None => None,
        }
    } else {
        None
    };

    // 5. Deterministic triage.
    let triage_decision: Option<TriageDecision> = match triage_rules {
        None => None,
        Some(_) if !triage_cache_available => {
            Some(TriageDecision::pass_through("cache_unavailable"))
        }
        Some(rules) => {
            let view = make_triage_envelope(&envelope);
            Some(evaluate_triage(&view, rules, affinity_target.as_deref(), metrics))
        }
    };

    // 6. Canonical request context.
    let request_id = butler_core::ids::new_request_id();
    let received_at = Utc::now();
    let context = RequestContext {
        request_id,
        received_at,
        source_channel: envelope.source.channel.clone(),
        source_endpoint_identity: envelope.source.endpoint_identity.clone(),
        source_sender_identity: envelope.sender.identity.clone(),
        source_thread_identity: envelope.event.external_thread_id.clone(),
        idempotency_key: envelope.control.idempotency_key.clone(),
        trace_context: envelope.control.trace_context.clone(),
        ingestion_tier: envelope.control.ingestion_tier,
        dedupe_key: Some(dedupe.key.clone()),
        dedupe_strategy: Some(dedupe.strategy.to_string()),
        triage: triage_decision.as_ref().map(|d| TriageAnnotation {
            decision: d.decision.as_str().to_string(),
            target_butler: d.target_butler.clone(),
            matched_rule_id: d.matched_rule_id,
            matched_rule_type: d.matched_rule_type.clone(),
            reason: d.reason.clone(),
        }),
    };

    // 7. Raw payload snapshot + attachments.
    let raw_snapshot = envelope.payload.raw.clone();
    let attachments = serde_json::to_string(&envelope.payload.attachments)?;

    // 8. Weekly partition seam.
    ensure_week_partition(db, received_at)?;

    // 9. Lifecycle state: metadata tier bypasses LLM classification downstream.
    let lifecycle_state = match envelope.control.ingestion_tier {
        IngestionTier::Metadata => "metadata_ref",
        _ => "accepted",
    };

    // 10. Insert; on a dedupe-key race, return the winner's request_id.
    let context_json = serde_json::to_string(&context)?;
    let now = received_at.to_rfc3339();
    let insert = db.with(|conn| {
        conn.execute(
            "INSERT INTO message_inbox
             (id, received_at, received_week, request_context, raw_payload, normalized_text,
              attachments, lifecycle_state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?2, ?2)",
            rusqlite::params![
                request_id.to_string(),
                now,
                week_label(received_at),
                context_json,
                raw_snapshot.map(|v| v.to_string()),
                envelope.payload.normalized_text,
                attachments,
                lifecycle_state,
            ],
        )
    });

    match insert {
        Ok(_) => {}
        Err(butler_db::DbError::Query(rusqlite::Error::SqliteFailure(e, _)))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            // Concurrent duplicate won the unique dedupe-key index.
            if let Some(existing) = find_request_by_dedupe_key(db, &dedupe.key)? {
                if let Some(m) = metrics {
                    m.dedupe_accepted_inc();
                }
                return Ok(IngestAcceptedResponse::accepted(existing, true));
            }
            return Err(SwitchboardError::Validation(
                "dedupe-key conflict without a surviving row".into(),
            ));
        }
        Err(e) => return Err(e.into()),
    }

    if let Some(m) = metrics {
        m.messages_ingested_inc();
    }
    info!(
        request_id = %request_id,
        channel = %envelope.source.channel,
        dedupe_strategy = dedupe.strategy,
        "message admitted"
    );

    let mut response = IngestAcceptedResponse::accepted(request_id, false);
    if let Some(decision) = triage_decision {
        response.triage_decision = Some(decision.decision.as_str().to_string());
        if decision.decision == Decision::RouteTo {
            response.triage_target = decision.target_butler;
        }
    }
    Ok(response)
}

/// Latest request_id for a dedupe key, via the unique expression index.
fn find_request_by_dedupe_key(db: &Db, dedupe_key: &str) -> Result<Option<Uuid>> {
    let key = dedupe_key.to_string();
    let found: Option<String> = db.with(move |conn| {
        conn.query_row(
            "SELECT id FROM message_inbox
             WHERE json_extract(request_context, '$.dedupe_key') = ?1
             ORDER BY received_at DESC
             LIMIT 1",
            [key.as_str()],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })
    })?;
    Ok(found.and_then(|s| Uuid::parse_str(&s).ok()))
}

/// Load an admitted message's normalized snapshot for the routing buffer.
pub fn load_inbox_row(db: &Db, request_id: &str) -> Result<Option<(RequestContext, String)>> {
    let id = request_id.to_string();
    let row: Option<(String, String)> = db.with(move |conn| {
        conn.query_row(
            "SELECT request_context, normalized_text FROM message_inbox WHERE id = ?1",
            [id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })
    })?;
    match row {
        None => Ok(None),
        Some((context_json, text)) => {
            let context: RequestContext = serde_json::from_str(&context_json)?;
            Ok(Some((context, text)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::record_thread_affinity;
    use crate::db::SWITCHBOARD_CHAIN;
    use butler_db::run_migrations;
    use serde_json::json;

    fn db() -> Db {
        let db = Db::open_in_memory().unwrap();
        run_migrations(&db, &SWITCHBOARD_CHAIN).unwrap();
        db
    }

    fn telegram_payload(event_id: &str) -> serde_json::Value {
        json!({
            "schema_version": "ingest.v1",
            "source": {"channel": "telegram", "provider": "telegram", "endpoint_identity": "@bot"},
            "event": {"external_event_id": event_id, "observed_at": "2026-07-01T10:15:00Z"},
            "sender": {"identity": "user-42"},
            "payload": {"normalized_text": "pay the rent"},
            "control": {}
        })
    }

    #[test]
    fn exact_duplicate_returns_same_request_id_one_row() {
        let db = db();
        let first = ingest_v1(&db, &telegram_payload("12345"), None, true, None, true, None).unwrap();
        assert!(!first.duplicate);
        assert_eq!(first.status, "accepted");

        let second =
            ingest_v1(&db, &telegram_payload("12345"), None, true, None, true, None).unwrap();
        assert!(second.duplicate);
        assert_eq!(second.request_id, first.request_id);
        assert!(second.triage_decision.is_none());

        let (count, dedupe_key): (i64, String) = db
            .with(|conn| {
                conn.query_row(
                    "SELECT count(*), max(json_extract(request_context, '$.dedupe_key'))
                     FROM message_inbox",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(dedupe_key, "event:telegram:telegram:@bot:12345");
    }

    #[test]
    fn invalid_envelope_is_a_validation_error() {
        let db = db();
        let err = ingest_v1(&db, &json!({"nope": true}), None, true, None, true, None).unwrap_err();
        assert!(matches!(err, SwitchboardError::Validation(_)));
    }

    #[test]
    fn triage_annotation_lands_in_context_and_response() {
        let db = db();
        let rules = vec![TriageRule {
            id: 1,
            priority: 1,
            rule_type: "sender_address".to_string(),
            condition: json!({"value": "user-42"}),
            action: "route_to:finance".to_string(),
        }];
        let response = ingest_v1(
            &db,
            &telegram_payload("900"),
            Some(&rules),
            true,
            None,
            true,
            None,
        )
        .unwrap();
        assert_eq!(response.triage_decision.as_deref(), Some("route_to"));
        assert_eq!(response.triage_target.as_deref(), Some("finance"));

        let (context, _text) =
            load_inbox_row(&db, &response.request_id.to_string()).unwrap().unwrap();
        assert_eq!(context.triage.unwrap().target_butler.as_deref(), Some("finance"));
    }

    #[test]
    fn cache_unavailable_records_pass_through() {
        let db = db();
        let response = ingest_v1(
            &db,
            &telegram_payload("901"),
            Some(&[]),
            false,
            None,
            true,
            None,
        )
        .unwrap();
        assert_eq!(response.triage_decision.as_deref(), Some("pass_through"));

        let (context, _) = load_inbox_row(&db, &response.request_id.to_string()).unwrap().unwrap();
        assert_eq!(
            context.triage.unwrap().reason.as_deref(),
            Some("cache_unavailable")
        );
    }

    #[test]
    fn email_thread_affinity_steers_triage() {
        let db = db();
        record_thread_affinity(&db, "email", "me@x.com", "thread-9", "relationship").unwrap();
        let payload = json!({
            "schema_version": "ingest.v1",
            "source": {"channel": "email", "provider": "gmail", "endpoint_identity": "me@x.com"},
            "event": {
                "external_event_id": "m-1",
                "external_thread_id": "thread-9",
                "observed_at": "2026-07-01T10:15:00Z"
            },
            "sender": {"identity": "anna@friends.org"},
            "payload": {"normalized_text": "see you saturday!"},
            "control": {}
        });
        let response = ingest_v1(&db, &payload, Some(&[]), true, None, true, None).unwrap();
        assert_eq!(response.triage_decision.as_deref(), Some("route_to"));
        assert_eq!(response.triage_target.as_deref(), Some("relationship"));
    }

    #[test]
    fn metadata_tier_sets_metadata_ref_state() {
        let db = db();
        let mut payload = telegram_payload("902");
        payload["control"]["ingestion_tier"] = json!("metadata");
        let response = ingest_v1(&db, &payload, None, true, None, true, None).unwrap();

        let state: String = db
            .with(|conn| {
                conn.query_row(
                    "SELECT lifecycle_state FROM message_inbox WHERE id = ?1",
                    [response.request_id.to_string().as_str()],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(state, "metadata_ref");
    }

    #[test]
    fn request_ids_are_time_ordered() {
        let db = db();
        let first = ingest_v1(&db, &telegram_payload("a1"), None, true, None, true, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = ingest_v1(&db, &telegram_payload("a2"), None, true, None, true, None).unwrap();
        assert!(second.request_id > first.request_id);
    }
}
