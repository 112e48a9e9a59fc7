use std::collections::BTreeMap;
use std::time::Instant;

use butler_protocol::envelope::IngestEnvelopeV1;
use butler_telemetry::ButlerMetrics;
use serde_json::Value;
use tracing::warn;

/// Deterministic pre-classification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    RouteTo,
    Skip,
    MetadataOnly,
    LowPriorityQueue,
    PassThrough,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::RouteTo => "route_to",
            Decision::Skip => "skip",
            Decision::MetadataOnly => "metadata_only",
            Decision::LowPriorityQueue => "low_priority_queue",
            Decision::PassThrough => "pass_through",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriageDecision {
    pub decision: Decision,
    pub target_butler: Option<String>,
    pub matched_rule_id: Option<i64>,
    pub matched_rule_type: Option<String>,
    pub reason: Option<String>,
}

impl TriageDecision {
    pub fn pass_through(reason: &str) -> Self {
        Self {
            decision: Decision::PassThrough,
            target_butler: None,
            matched_rule_id: None,
            matched_rule_type: None,
            reason: Some(reason.to_string()),
        }
    }
}

/// One persisted triage rule. `condition` is the typed rule config as JSON.
#[derive(Debug, Clone)]
pub struct TriageRule {
    pub id: i64,
    pub priority: i64,
    pub rule_type: String,
    pub condition: Value,
    /// `route_to:<butler>` or a literal decision name.
    pub action: String,
}

/// Load the persisted rule set, priority-then-id ordered.
pub fn load_rules(db: &butler_db::Db) -> crate::error::Result<Vec<TriageRule>> {
    Ok(db.with(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, priority, rule_type, condition, action FROM triage_rules
             ORDER BY priority, id",
        )?;
        let rows = stmt.query_map([], |row| {
            let condition: String = row.get(3)?;
            Ok(TriageRule {
                id: row.get(0)?,
                priority: row.get(1)?,
                rule_type: row.get(2)?,
                condition: serde_json::from_str(&condition).unwrap_or(Value::Null),
                action: row.get(4)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
    })?)
}

/// The envelope fields triage conditions can see.
#[derive(Debug, Clone, Default)]
pub struct TriageEnvelope {
    pub channel: String,
    pub sender: String,
    /// Header names lowercased.
    pub headers: BTreeMap<String, String>,
    pub labels: Vec<String>,
}

/// Project an ingest envelope into the triage view. Headers and labels come
/// from the connector's raw payload when present.
pub fn make_triage_envelope(envelope: &IngestEnvelopeV1) -> TriageEnvelope {
    let mut headers = BTreeMap::new();
    let mut labels = Vec::new();
    if let Some(ref raw) = envelope.payload.raw {
        if let Some(map) = raw.get("headers").and_then(|h| h.as_object()) {
            for (key, value) in map {
                if let Some(v) = value.as_str() {
                    headers.insert(key.to_lowercase(), v.to_string());
                }
            }
        }
        if let Some(items) = raw.get("labels").and_then(|l| l.as_array()) {
            labels.extend(items.iter().filter_map(|v| v.as_str()).map(str::to_string));
        }
    }
    TriageEnvelope {
        channel: envelope.source.channel.clone(),
        sender: envelope.sender.identity.clone(),
        headers,
        labels,
    }
}

/// Evaluate triage rules in deterministic order; first truthy rule wins.
///
/// Thread affinity, when provided, acts as a synthetic highest-priority
/// `route_to:<target>` rule. Any per-rule malfunction skips that rule; the
/// evaluator as a whole fails open to `pass_through`.
pub fn evaluate_triage(
    envelope: &TriageEnvelope,
    rules: &[TriageRule],
    affinity_target: Option<&str>,
    metrics: Option<&ButlerMetrics>,
) -> TriageDecision {
    let t0 = Instant::now();
    let decision = evaluate_inner(envelope, rules, affinity_target, metrics);
    if let Some(m) = metrics {
        m.record_triage_latency(t0.elapsed().as_millis() as u64, decision.decision.as_str());
    }
    decision
}

fn evaluate_inner(
    envelope: &TriageEnvelope,
    rules: &[TriageRule],
    affinity_target: Option<&str>,
    metrics: Option<&ButlerMetrics>,
) -> TriageDecision {
    if let Some(target) = affinity_target {
        if let Some(m) = metrics {
            m.triage_rule_matched("thread_affinity", "route_to", &envelope.channel);
        }
        return TriageDecision {
            decision: Decision::RouteTo,
            target_butler: Some(target.to_string()),
            matched_rule_id: None,
            matched_rule_type: Some("thread_affinity".to_string()),
            reason: Some("thread previously routed".to_string()),
        };
    }

    let mut ordered: Vec<&TriageRule> = rules.iter().collect();
    ordered.sort_by_key(|r| (r.priority, r.id));

    for rule in ordered {
        let matched = match rule.rule_type.as_str() {
            "sender_domain" => match_sender_domain(&envelope.sender, &rule.condition),
            "sender_address" => match_sender_address(&envelope.sender, &rule.condition),
            "header_condition" => match_header(&envelope.headers, &rule.condition),
            "label_match" => match_label(&envelope.labels, &rule.condition),
            other => {
                warn!(rule_id = rule.id, rule_type = other, "unknown triage rule type skipped");
                false
            }
        };
        if !matched {
            continue;
        }

        let decision = parse_action(&rule.action);
        if let Some(m) = metrics {
            m.triage_rule_matched(&rule.rule_type, decision.decision.as_str(), &envelope.channel);
        }
        return TriageDecision {
            matched_rule_id: Some(rule.id),
            matched_rule_type: Some(rule.rule_type.clone()),
            ..decision
        };
    }

    if let Some(m) = metrics {
        m.triage_pass_through("no_rule_matched");
    }
    TriageDecision::pass_through("no_rule_matched")
}

fn parse_action(action: &str) -> TriageDecision {
    if let Some(target) = action.strip_prefix("route_to:") {
        return TriageDecision {
            decision: Decision::RouteTo,
            target_butler: Some(target.to_string()),
            matched_rule_id: None,
            matched_rule_type: None,
            reason: None,
        };
    }
    let decision = match action {
        "skip" => Decision::Skip,
        "metadata_only" => Decision::MetadataOnly,
        "low_priority_queue" => Decision::LowPriorityQueue,
        "pass_through" => Decision::PassThrough,
        other => {
            warn!(action = other, "unknown triage action; passing through");
            return TriageDecision::pass_through("unknown_action");
        }
    };
    TriageDecision {
        decision,
        target_butler: None,
        matched_rule_id: None,
        matched_rule_type: None,
        reason: None,
    }
}

fn sender_domain(sender: &str) -> Option<String> {
    sender.rsplit_once('@').map(|(_, d)| d.to_lowercase())
}

fn match_sender_domain(sender: &str, condition: &Value) -> bool {
    let Some(value) = condition.get("value").and_then(|v| v.as_str()) else {
        return false;
    };
    let Some(domain) = sender_domain(sender) else {
        return false;
    };
    let value = value.to_lowercase();
    match condition.get("match").and_then(|m| m.as_str()).unwrap_or("exact") {
        "suffix" => domain.ends_with(&value),
        _ => domain == value,
    }
}

fn match_sender_address(sender: &str, condition: &Value) -> bool {
    condition
        .get("value")
        .and_then(|v| v.as_str())
        .is_some_and(|value| sender.eq_ignore_ascii_case(value))
}

fn match_header(headers: &BTreeMap<String, String>, condition: &Value) -> bool {
    let Some(header) = condition.get("header").and_then(|v| v.as_str()) else {
        return false;
    };
    let actual = headers.get(&header.to_lowercase());
    match condition.get("op").and_then(|o| o.as_str()).unwrap_or("present") {
        "present" => actual.is_some(),
        "equals" => {
            let expected = condition.get("value").and_then(|v| v.as_str()).unwrap_or("");
            actual.is_some_and(|a| a == expected)
        }
        "contains" => {
            let needle = condition.get("value").and_then(|v| v.as_str()).unwrap_or("");
            !needle.is_empty() && actual.is_some_and(|a| a.contains(needle))
        }
        _ => false,
    }
}

fn match_label(labels: &[String], condition: &Value) -> bool {
    condition
        .get("value")
        .and_then(|v| v.as_str())
        .is_some_and(|value| labels.iter().any(|l| l.eq_ignore_ascii_case(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn email_envelope(sender: &str) -> TriageEnvelope {
        TriageEnvelope {
            channel: "email".to_string(),
            sender: sender.to_string(),
            headers: BTreeMap::from([
                ("list-id".to_string(), "dev-list.example.com".to_string()),
            ]),
            labels: vec!["Receipts".to_string()],
        }
    }

    fn rule(id: i64, priority: i64, rule_type: &str, condition: Value, action: &str) -> TriageRule {
        TriageRule {
            id,
            priority,
            rule_type: rule_type.to_string(),
            condition,
            action: action.to_string(),
        }
    }

    #[test]
    fn first_match_by_priority_then_id_wins() {
        let rules = vec![
            rule(7, 10, "sender_domain", json!({"value": "example.com"}), "skip"),
            rule(3, 10, "sender_domain", json!({"value": "example.com"}), "route_to:finance"),
            rule(1, 1, "sender_address", json!({"value": "other@else.com"}), "skip"),
        ];
        let decision = evaluate_triage(&email_envelope("bill@example.com"), &rules, None, None);
        // Equal priority: lower id (3) evaluates first.
        assert_eq!(decision.decision, Decision::RouteTo);
        assert_eq!(decision.target_butler.as_deref(), Some("finance"));
        assert_eq!(decision.matched_rule_id, Some(3));
    }

    #[test]
    fn suffix_domain_match() {
        let rules = vec![rule(
            1,
            1,
            "sender_domain",
            json!({"value": "example.com", "match": "suffix"}),
            "low_priority_queue",
        )];
        let decision =
            evaluate_triage(&email_envelope("noreply@mail.example.com"), &rules, None, None);
        assert_eq!(decision.decision, Decision::LowPriorityQueue);
    }

    #[test]
    fn header_and_label_conditions() {
        let present = rule(1, 1, "header_condition", json!({"header": "List-Id"}), "skip");
        let contains = rule(
            2,
            2,
            "header_condition",
            json!({"header": "list-id", "op": "contains", "value": "dev-list"}),
            "metadata_only",
        );
        let label = rule(3, 3, "label_match", json!({"value": "receipts"}), "route_to:finance");

        let envelope = email_envelope("a@b.com");
        assert_eq!(
            evaluate_triage(&envelope, &[present], None, None).decision,
            Decision::Skip
        );
        assert_eq!(
            evaluate_triage(&envelope, &[contains], None, None).decision,
            Decision::MetadataOnly
        );
        let by_label = evaluate_triage(&envelope, &[label], None, None);
        assert_eq!(by_label.decision, Decision::RouteTo);
        assert_eq!(by_label.target_butler.as_deref(), Some("finance"));
    }

    #[test]
    fn thread_affinity_beats_every_rule() {
        let rules = vec![rule(
            1,
            0,
            "sender_domain",
            json!({"value": "example.com"}),
            "skip",
        )];
        let decision =
            evaluate_triage(&email_envelope("x@example.com"), &rules, Some("relationship"), None);
        assert_eq!(decision.decision, Decision::RouteTo);
        assert_eq!(decision.target_butler.as_deref(), Some("relationship"));
        assert_eq!(decision.matched_rule_type.as_deref(), Some("thread_affinity"));
    }

    #[test]
    fn unknown_rule_types_are_skipped() {
        let rules = vec![
            rule(1, 1, "astrology_sign", json!({"value": "leo"}), "skip"),
            rule(2, 2, "sender_address", json!({"value": "a@b.com"}), "skip"),
        ];
        let decision = evaluate_triage(&email_envelope("a@b.com"), &rules, None, None);
        assert_eq!(decision.decision, Decision::Skip);
        assert_eq!(decision.matched_rule_id, Some(2));
    }

    #[test]
    fn no_match_is_pass_through() {
        let decision = evaluate_triage(&email_envelope("a@b.com"), &[], None, None);
        assert_eq!(decision.decision, Decision::PassThrough);
        assert_eq!(decision.reason.as_deref(), Some("no_rule_matched"));
    }

    #[test]
    fn unknown_action_fails_open() {
        let rules = vec![rule(
            1,
            1,
            "sender_address",
            json!({"value": "a@b.com"}),
            "explode",
        )];
        let decision = evaluate_triage(&email_envelope("a@b.com"), &rules, None, None);
        assert_eq!(decision.decision, Decision::PassThrough);
        assert_eq!(decision.reason.as_deref(), Some("unknown_action"));
    }

    #[test]
    fn determinism_same_inputs_same_decision() {
        let rules = vec![
            rule(1, 5, "label_match", json!({"value": "Receipts"}), "route_to:finance"),
            rule(2, 1, "sender_domain", json!({"value": "b.com"}), "low_priority_queue"),
        ];
        let envelope = email_envelope("a@b.com");
        let first = evaluate_triage(&envelope, &rules, None, None);
        for _ in 0..10 {
            let again = evaluate_triage(&envelope, &rules, None, None);
            assert_eq!(again.decision, first.decision);
            assert_eq!(again.matched_rule_id, first.matched_rule_id);
        }
    }
}
