use butler_db::Db;
use butler_protocol::envelope::IngestEnvelopeV1;
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// External event ids that are not meaningful stable identifiers.
const PLACEHOLDER_EVENT_IDS: &[&str] = &["placeholder", "unknown", "none", ""];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupeKey {
    pub key: String,
    pub strategy: &'static str,
}

/// Compute the stable deduplication key for an ingest envelope.
///
/// Priority: explicit idempotency key, then external event id, then a content
/// hash bucketed by hour. The hourly bucket gives soft protection for sources
/// without stable event ids; two identical messages straddling an hour
/// boundary intentionally get different keys (no cross-bucket tolerance).
pub fn compute_dedupe_key(envelope: &IngestEnvelopeV1) -> DedupeKey {
    let source = &envelope.source;

    if let Some(ref idem) = envelope.control.idempotency_key {
        if !idem.is_empty() {
            return DedupeKey {
                key: format!(
                    "idem:{}:{}:{}",
                    source.channel, source.endpoint_identity, idem
                ),
                strategy: "idempotency_key",
            };
        }
    }

    if let Some(ref event_id) = envelope.event.external_event_id {
        if !PLACEHOLDER_EVENT_IDS.contains(&event_id.to_lowercase().as_str()) {
            return DedupeKey {
                key: format!(
                    "event:{}:{}:{}:{}",
                    source.channel, source.provider, source.endpoint_identity, event_id
                ),
                strategy: "external_event_id",
            };
        }
    }

    let content_repr = format!(
        "{}:{}",
        envelope.payload.normalized_text, envelope.sender.identity
    );
    let digest = Sha256::digest(content_repr.as_bytes());
    let content_hash = &hex::encode(digest)[..16];
    let time_bucket = envelope.event.observed_at.format("%Y%m%d%H");
    DedupeKey {
        key: format!(
            "hash:{}:{}:{}:{}:{}",
            source.channel,
            source.endpoint_identity,
            envelope.sender.identity,
            time_bucket,
            content_hash
        ),
        strategy: "content_hash",
    }
}

/// Has this request already been processed by the routing pipeline inside the
/// retention window?
pub fn ingress_seen(db: &Db, key: &str, retention_days: u32) -> Result<bool> {
    let cutoff = (Utc::now() - Duration::days(retention_days as i64)).to_rfc3339();
    let key = key.to_string();
    Ok(db.with(move |conn| {
        conn.query_row(
            "SELECT 1 FROM ingress_dedupe WHERE dedupe_key = ?1 AND processed_at >= ?2",
            rusqlite::params![key, cutoff],
            |_| Ok(true),
        )
        .map(|_| true)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(false),
            other => Err(other),
        })
    })?)
}

/// Record the ingress-dedupe marker after a successful route.
pub fn record_ingress(db: &Db, key: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let key = key.to_string();
    db.with(move |conn| {
        conn.execute(
            "INSERT INTO ingress_dedupe (dedupe_key, processed_at) VALUES (?1, ?2)
             ON CONFLICT(dedupe_key) DO UPDATE SET processed_at = excluded.processed_at",
            rusqlite::params![key, now],
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use butler_protocol::envelope::parse_ingest_envelope;
    use serde_json::json;

    fn envelope(overrides: impl FnOnce(&mut serde_json::Value)) -> IngestEnvelopeV1 {
        let mut raw = json!({
            "schema_version": "ingest.v1",
            "source": {"channel": "telegram", "provider": "telegram", "endpoint_identity": "@bot"},
            "event": {"observed_at": "2026-07-01T10:59:30Z"},
            "sender": {"identity": "user-1"},
            "payload": {"normalized_text": "hello"},
            "control": {}
        });
        overrides(&mut raw);
        parse_ingest_envelope(&raw).unwrap()
    }

    #[test]
    fn idempotency_key_wins() {
        let env = envelope(|raw| {
            raw["control"]["idempotency_key"] = json!("abc");
            raw["event"]["external_event_id"] = json!("12345");
        });
        let key = compute_dedupe_key(&env);
        assert_eq!(key.key, "idem:telegram:@bot:abc");
        assert_eq!(key.strategy, "idempotency_key");
    }

    #[test]
    fn external_event_id_is_second() {
        let env = envelope(|raw| {
            raw["event"]["external_event_id"] = json!("12345");
        });
        let key = compute_dedupe_key(&env);
        assert_eq!(key.key, "event:telegram:telegram:@bot:12345");
    }

    #[test]
    fn placeholder_event_ids_fall_through_to_hash() {
        for placeholder in ["placeholder", "UNKNOWN", "None", ""] {
            let env = envelope(|raw| {
                raw["event"]["external_event_id"] = json!(placeholder);
            });
            let key = compute_dedupe_key(&env);
            assert_eq!(key.strategy, "content_hash", "for {placeholder:?}");
            assert!(key.key.starts_with("hash:telegram:@bot:user-1:2026070110:"));
        }
    }

    #[test]
    fn hash_bucket_splits_at_hour_boundary() {
        let before = envelope(|raw| {
            raw["event"]["observed_at"] = json!("2026-07-01T10:59:59Z");
        });
        let after = envelope(|raw| {
            raw["event"]["observed_at"] = json!("2026-07-01T11:00:01Z");
        });
        // Identical content one second apart across the boundary: distinct keys.
        assert_ne!(compute_dedupe_key(&before).key, compute_dedupe_key(&after).key);
    }

    #[test]
    fn hash_is_stable_for_identical_input() {
        let a = envelope(|_| {});
        let b = envelope(|_| {});
        assert_eq!(compute_dedupe_key(&a), compute_dedupe_key(&b));
    }
}
