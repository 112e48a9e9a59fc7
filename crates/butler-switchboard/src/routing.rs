use std::sync::Arc;
use std::time::Instant;

use butler_core::config::RoutingConfig;
use butler_db::Db;
use butler_runtime::ToolCall;
use butler_telemetry::ButlerMetrics;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tracing::{info, warn};

use crate::affinity::record_thread_affinity;
use crate::buffer::QueueItem;
use crate::catalog::{list_available_butlers, render_catalog};
use crate::dedupe::{ingress_seen, record_ingress};
use crate::error::Result;
use crate::history::load_conversation_history;

/// What the classifier session produced.
#[derive(Debug, Clone)]
pub struct ClassifierOutcome {
    pub success: bool,
    pub tool_calls: Vec<ToolCall>,
}

/// Invoke the classifier (typically the switchboard router's spawner).
pub type DispatchFn = Arc<
    dyn Fn(String) -> BoxFuture<'static, std::result::Result<ClassifierOutcome, String>>
        + Send
        + Sync,
>;

/// Hand the message to the chosen butler. An `Err` propagates back to the
/// buffer worker so the durable row is retried.
pub type ForwardFn = Arc<
    dyn Fn(String, QueueItem) -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync,
>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingResult {
    /// Already processed inside the ingress-dedupe retention window.
    Duplicate,
    Routed {
        target_butler: String,
        fallback_used: bool,
    },
}

/// Consumes routed messages from the durable buffer and dispatches them.
pub struct RoutingPipeline {
    db: Db,
    config: RoutingConfig,
    metrics: ButlerMetrics,
    dispatch_fn: DispatchFn,
    forward_fn: ForwardFn,
}

impl RoutingPipeline {
    pub fn new(
        db: Db,
        config: RoutingConfig,
        metrics: ButlerMetrics,
        dispatch_fn: DispatchFn,
        forward_fn: ForwardFn,
    ) -> Self {
        Self {
            db,
            config,
            metrics,
            dispatch_fn,
            forward_fn,
        }
    }

    /// Route one message end to end.
    ///
    /// Failures after the classifier (forwarding) return an error string so
    /// the buffer leaves the durable row for retry; everything before that is
    /// deterministic enough to re-run safely (at-least-once + ingress dedupe).
    pub async fn process(&self, item: QueueItem) -> std::result::Result<RoutingResult, String> {
        let t0 = Instant::now();

        if ingress_seen(&self.db, &item.request_id, self.config.ingress_dedupe_retention_days)
            .map_err(|e| e.to_string())?
        {
            info!(request_id = %item.request_id, "ingress dedupe hit; skipping");
            return Ok(RoutingResult::Duplicate);
        }

        let event = parse_event(&item.event);

        // Deterministic triage already chose: no classifier session needed.
        if let Some(target) = item.triage_target.clone().filter(|t| !t.is_empty()) {
            return self.finish(item, event, target, false, t0).await;
        }
        let (thread_id, observed_at) = (event.thread_id.clone(), event.observed_at);

        let history = load_conversation_history(
            &self.db,
            &item.source,
            thread_id.as_deref(),
            observed_at.unwrap_or_else(Utc::now),
            &self.config.history,
        );

        let prompt = self.build_prompt(&item, &history).map_err(|e| e.to_string())?;

        let (target, fallback_used) = match (self.dispatch_fn)(prompt).await {
            Ok(outcome) if outcome.success => match last_route_decision(&outcome.tool_calls) {
                Some(target) => (target, false),
                None => {
                    warn!(request_id = %item.request_id, "classifier made no routing call; using fallback");
                    (self.config.fallback_butler.clone(), true)
                }
            },
            Ok(_) | Err(_) => {
                warn!(request_id = %item.request_id, "classifier session failed; using fallback");
                (self.config.fallback_butler.clone(), true)
            }
        };

        self.finish(item, event, target, fallback_used, t0).await
    }

    /// Forward, then mark processed and remember thread affinity.
    async fn finish(
        &self,
        item: QueueItem,
        event: RoutedEvent,
        target: String,
        fallback_used: bool,
        t0: Instant,
    ) -> std::result::Result<RoutingResult, String> {
        (self.forward_fn)(target.clone(), item.clone()).await?;

        record_ingress(&self.db, &item.request_id).map_err(|e| e.to_string())?;
        if item.source == "email" {
            if let Some(ref thread) = event.thread_id {
                // The affinity key must match the ingest-time lookup, which
                // is keyed on the envelope's endpoint identity.
                let endpoint = event.endpoint_identity.as_deref().unwrap_or("");
                if let Err(e) =
                    record_thread_affinity(&self.db, "email", endpoint, thread, &target)
                {
                    warn!(error = %e, "thread affinity record failed");
                }
            }
        }

        self.metrics
            .record_process_latency(t0.elapsed().as_millis() as u64);
        info!(request_id = %item.request_id, target = %target, fallback_used, "message routed");
        Ok(RoutingResult::Routed {
            target_butler: target,
            fallback_used,
        })
    }

    fn build_prompt(&self, item: &QueueItem, history: &str) -> Result<String> {
        let catalog = render_catalog(&list_available_butlers(&self.db)?);
        let mut prompt = String::new();
        prompt.push_str(
            "You are the switchboard router. Read the incoming message and choose the \
             single best butler, then call the `route_to_butler` tool with its name.\n\n",
        );
        prompt.push_str(&catalog);
        if !history.is_empty() {
            prompt.push('\n');
            prompt.push_str(history);
            prompt.push('\n');
        }
        prompt.push_str(&format!(
            "\n## Incoming Message\n\nChannel: {}\nSender: {}\n\n{}\n",
            item.source, item.sender, item.message_text
        ));
        Ok(prompt)
    }
}

/// The authoritative decision is the LAST successful `route_to_butler` call.
fn last_route_decision(tool_calls: &[ToolCall]) -> Option<String> {
    tool_calls
        .iter()
        .rev()
        .find(|call| call.name == "route_to_butler")
        .and_then(|call| call.input.get("butler"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The event-snapshot fields the pipeline needs.
#[derive(Debug, Clone, Default)]
struct RoutedEvent {
    thread_id: Option<String>,
    observed_at: Option<DateTime<Utc>>,
    endpoint_identity: Option<String>,
}

fn parse_event(event_json: &str) -> RoutedEvent {
    let Ok(event) = serde_json::from_str::<serde_json::Value>(event_json) else {
        return RoutedEvent::default();
    };
    RoutedEvent {
        thread_id: event
            .get("external_thread_id")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        observed_at: event
            .get("observed_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        endpoint_identity: event
            .get("endpoint_identity")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    }
}
