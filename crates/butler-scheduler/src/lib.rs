//! Durable cron-like schedules per butler.
//!
//! `sync_schedules` reconciles butler.toml entries into the `schedules`
//! table; the engine polls at 1 s precision and forwards fired entries over
//! an mpsc channel to the daemon, which dispatches them through the spawner
//! with `trigger_source = "schedule:<name>"`.

pub mod engine;
pub mod error;
pub mod schedule;

pub use engine::{sync_schedules, FiredSchedule, SchedulerEngine};
pub use error::{Result, SchedulerError};
pub use schedule::compute_next_run;
