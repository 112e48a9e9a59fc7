//! Switchboard core: the sole ingress/egress for external messaging.
//!
//! Connector envelopes enter through `ingest_v1`, survive in the durable
//! buffer, and leave through the routing pipeline toward a specialist butler.
//! Everything in this crate is owned by the switchboard database.

pub mod affinity;
pub mod buffer;
pub mod catalog;
pub mod db;
pub mod dedupe;
pub mod delivery;
pub mod error;
pub mod history;
pub mod ingest;
pub mod routing;
pub mod triage;

pub use buffer::{DurableBuffer, EnqueuePath, QueueItem};
pub use error::{Result, SwitchboardError};
pub use ingest::ingest_v1;
pub use routing::{RoutingPipeline, RoutingResult};
pub use triage::{evaluate_triage, Decision, TriageDecision, TriageRule};
