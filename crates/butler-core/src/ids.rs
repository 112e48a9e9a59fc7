use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Mint a time-ordered request id (UUIDv7 — 48-bit ms timestamp in the
/// high bits, so ordering by id approximates ordering by time).
pub fn new_request_id() -> Uuid {
    Uuid::now_v7()
}

/// Mint a time-ordered session id. Same shape as request ids; a separate
/// constructor keeps call sites self-describing.
pub fn new_session_id() -> Uuid {
    Uuid::now_v7()
}

/// Extract the embedded millisecond timestamp from a v7 id.
///
/// Returns `None` for non-v7 UUIDs (e.g. entity ids, which are v4).
pub fn timestamp_of(id: &Uuid) -> Option<DateTime<Utc>> {
    if id.get_version_num() != 7 {
        return None;
    }
    let bytes = id.as_bytes();
    let mut ms: u64 = 0;
    for b in &bytes[..6] {
        ms = (ms << 8) | u64::from(*b);
    }
    Utc.timestamp_millis_opt(ms as i64).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_time_ordered() {
        let a = new_request_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_request_id();
        assert!(a < b, "later id must sort after earlier id");
    }

    #[test]
    fn timestamp_round_trips_within_a_second() {
        let before = Utc::now();
        let id = new_session_id();
        let ts = timestamp_of(&id).expect("v7 id carries a timestamp");
        assert!((ts - before).num_milliseconds().abs() < 1000);
    }

    #[test]
    fn v4_ids_have_no_timestamp() {
        let id = Uuid::new_v4();
        assert!(timestamp_of(&id).is_none());
    }
}
