//! Process-wide observability: install-once OTel providers, a local metric
//! registry that backs heartbeat counter snapshots, and W3C traceparent
//! propagation between daemons and spawned runtime sessions.

pub mod metrics;
pub mod otel;
pub mod traceparent;

pub use metrics::{ButlerMetrics, MetricRegistry};
pub use otel::{init_telemetry, telemetry_installed, tracing_layer};
pub use traceparent::TraceParent;
