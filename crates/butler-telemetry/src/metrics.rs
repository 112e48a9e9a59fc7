use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
use opentelemetry::KeyValue;

/// Local metric registry.
///
/// Every counter/gauge is mirrored to an OTel instrument (no-op when no OTLP
/// pipeline is installed) AND kept as a process-local atomic so heartbeats
/// can snapshot the current values without a metrics backend. Instruments
/// are cached by name.
pub struct MetricRegistry {
    meter: Meter,
    counters: DashMap<String, (Arc<AtomicU64>, Counter<u64>)>,
    gauges: DashMap<String, (Arc<AtomicI64>, UpDownCounter<i64>)>,
    histograms: DashMap<String, Histogram<u64>>,
}

impl MetricRegistry {
    pub fn new(scope: &'static str) -> Self {
        Self {
            meter: global::meter(scope),
            counters: DashMap::new(),
            gauges: DashMap::new(),
            histograms: DashMap::new(),
        }
    }

    pub fn counter_add(&self, name: &str, value: u64) {
        let (local, instrument) = self
            .counters
            .entry(name.to_string())
            .or_insert_with(|| {
                (
                    Arc::new(AtomicU64::new(0)),
                    self.meter.u64_counter(name.to_string()).build(),
                )
            })
            .clone();
        local.fetch_add(value, Ordering::Relaxed);
        instrument.add(value, &[]);
    }

    pub fn counter_inc(&self, name: &str) {
        self.counter_add(name, 1);
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|entry| entry.0.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn gauge_entry(&self, name: &str) -> (Arc<AtomicI64>, UpDownCounter<i64>) {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| {
                (
                    Arc::new(AtomicI64::new(0)),
                    self.meter.i64_up_down_counter(name.to_string()).build(),
                )
            })
            .clone()
    }

    pub fn gauge_add(&self, name: &str, delta: i64) {
        let (local, instrument) = self.gauge_entry(name);
        let new = local.fetch_add(delta, Ordering::Relaxed) + delta;
        instrument.add(delta, &[]);
        debug_assert!(new >= 0, "gauge {name} went negative");
    }

    pub fn gauge_set(&self, name: &str, value: i64) {
        let (local, instrument) = self.gauge_entry(name);
        let old = local.swap(value, Ordering::Relaxed);
        instrument.add(value - old, &[]);
    }

    pub fn gauge_value(&self, name: &str) -> i64 {
        self.gauges
            .get(name)
            .map(|entry| entry.0.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn record_histogram(&self, name: &str, value: u64, labels: &[(&str, String)]) {
        let hist = self
            .histograms
            .entry(name.to_string())
            .or_insert_with(|| self.meter.u64_histogram(name.to_string()).build())
            .clone();
        let attrs: Vec<KeyValue> = labels
            .iter()
            .map(|(k, v)| KeyValue::new(k.to_string(), v.clone()))
            .collect();
        hist.record(value, &attrs);
    }

    /// Snapshot of every counter, for heartbeat envelopes.
    pub fn counter_snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|e| (e.key().clone(), e.value().0.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Named instruments for one butler daemon.
///
/// Thin facade over [`MetricRegistry`] so call sites never stringly-type the
/// hot-path metric names.
#[derive(Clone)]
pub struct ButlerMetrics {
    registry: Arc<MetricRegistry>,
    butler: String,
}

impl ButlerMetrics {
    pub fn new(butler_name: &str) -> Self {
        Self {
            registry: Arc::new(MetricRegistry::new("butlers")),
            butler: butler_name.to_string(),
        }
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    pub fn butler_name(&self) -> &str {
        &self.butler
    }

    // --- spawner -----------------------------------------------------------

    pub fn spawner_queued_triggers_inc(&self) {
        self.registry.gauge_add("spawner.queued_triggers", 1);
    }

    pub fn spawner_queued_triggers_dec(&self) {
        self.registry.gauge_add("spawner.queued_triggers", -1);
    }

    pub fn spawner_active_sessions_inc(&self) {
        self.registry.gauge_add("spawner.active_sessions", 1);
    }

    pub fn spawner_active_sessions_dec(&self) {
        self.registry.gauge_add("spawner.active_sessions", -1);
    }

    pub fn queued_triggers(&self) -> i64 {
        self.registry.gauge_value("spawner.queued_triggers")
    }

    pub fn active_sessions(&self) -> i64 {
        self.registry.gauge_value("spawner.active_sessions")
    }

    pub fn record_session_duration(&self, duration_ms: u64) {
        self.registry.record_histogram(
            "spawner.session_duration_ms",
            duration_ms,
            &[("butler", self.butler.clone())],
        );
    }

    // --- durable buffer ----------------------------------------------------

    pub fn buffer_depth_add(&self, delta: i64) {
        self.registry.gauge_add("route.queue_depth", delta);
    }

    pub fn buffer_depth(&self) -> i64 {
        self.registry.gauge_value("route.queue_depth")
    }

    pub fn backpressure_inc(&self) {
        self.registry.counter_inc("route.backpressure_total");
    }

    pub fn scanner_recovered_inc(&self, count: u64) {
        self.registry.counter_add("route.scanner_recovered_total", count);
    }

    pub fn record_process_latency(&self, latency_ms: u64) {
        self.registry.record_histogram(
            "route.process_latency_ms",
            latency_ms,
            &[("butler", self.butler.clone())],
        );
    }

    pub fn record_accept_latency(&self, latency_ms: u64) {
        self.registry.record_histogram(
            "route.accept_latency_ms",
            latency_ms,
            &[("butler", self.butler.clone())],
        );
    }

    // --- triage ------------------------------------------------------------

    pub fn triage_rule_matched(&self, rule_type: &str, action: &str, source_channel: &str) {
        self.registry.counter_inc(&format!(
            "triage.rule_matched.{rule_type}.{action}.{source_channel}"
        ));
    }

    pub fn triage_pass_through(&self, reason: &str) {
        self.registry
            .counter_inc(&format!("triage.pass_through.{reason}"));
    }

    pub fn record_triage_latency(&self, latency_ms: u64, result: &str) {
        self.registry.record_histogram(
            "triage.evaluation_latency_ms",
            latency_ms,
            &[("result", result.to_string())],
        );
    }

    // --- connector-facing counters (heartbeat snapshot keys) ---------------

    pub fn messages_ingested_inc(&self) {
        self.registry.counter_inc("messages_ingested");
    }

    pub fn messages_failed_inc(&self) {
        self.registry.counter_inc("messages_failed");
    }

    pub fn dedupe_accepted_inc(&self) {
        self.registry.counter_inc("dedupe_accepted");
    }

    pub fn source_api_calls_inc(&self) {
        self.registry.counter_inc("source_api_calls");
    }

    pub fn checkpoint_saves_inc(&self) {
        self.registry.counter_inc("checkpoint_saves");
    }
}
