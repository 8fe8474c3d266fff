//! fleet-housekeeping — recurring eviction of long-unusable nodes.
//!
//! One recurring job per scheduler asks the core to purge nodes that have
//! been `Down` for at least the configured TTL. The job is a tokio task
//! with a shutdown signal, driven by a fixed period or a cron expression;
//! starting twice keeps a single job.

pub mod scheduler;

pub use scheduler::{HousekeepingScheduler, HousekeepingSettings};
