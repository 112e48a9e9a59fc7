//! Connector-side plumbing shared by every transport process and butler:
//! periodic heartbeats, atomic checkpoint persistence, and the butler →
//! switchboard liveness reporter.

pub mod checkpoint;
pub mod heartbeat;
pub mod liveness;

pub use checkpoint::{load_checkpoint, save_checkpoint};
pub use heartbeat::{
    clamp_interval, parse_enabled, ConnectorHeartbeat, HeartbeatSink, HeartbeatTaskConfig,
};
pub use liveness::LivenessReporter;
