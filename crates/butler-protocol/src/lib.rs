//! Wire contracts shared by connectors, the switchboard, and butler daemons.
//!
//! Versioned envelopes (`ingest.v1`, `connector.heartbeat.v1`) are the only
//! payloads that cross process boundaries; compatibility is pinned by the
//! tests in `tests/wire_compat.rs`.

pub mod envelope;
pub mod heartbeat;
pub mod module_state;

pub use envelope::{
    parse_ingest_envelope, IngestAcceptedResponse, IngestEnvelopeV1, IngestionTier, PolicyTier,
    RequestContext, TriageAnnotation,
};
pub use heartbeat::{HealthState, HeartbeatEnvelope};
pub use module_state::{ModuleHealth, ModuleStateDto};
