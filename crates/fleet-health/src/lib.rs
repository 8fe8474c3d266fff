//! fleet-health — reachability probing and down detection for the fleet.
//!
//! The `HealthMonitor` runs one probe cycle per interval across every node
//! that is not on its way out of the registry. Each probe carries its own
//! timeout, and a node is reported to the core only after N consecutive
//! failed probes.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── background probe loop (interval, watch shutdown)
//!   │   ├── RmCore::probe_targets()
//!   │   ├── NodeHandle::is_reachable() per node, concurrently, with timeout
//!   │   └── HealthTracker per node (consecutive failures)
//!   └── RmCore::detected_pinged_down_node() on Healthy → Unhealthy
//! ```
//!
//! A single successful probe resets the failure count, so transient
//! failures are never reported.

pub mod checker;
pub mod handle;
pub mod monitor;

pub use checker::{HealthStatus, HealthTracker, ProbeResult, http_probe};
pub use handle::HttpNodeHandle;
pub use monitor::{HealthMonitor, HealthSettings};
