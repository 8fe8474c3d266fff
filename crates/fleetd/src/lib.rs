//! fleetd — the resource fleet daemon.
//!
//! Assembles the fleet subsystems into one process:
//! - `RmCore` registry and node sources from the config file
//! - Health monitor probe loop
//! - Housekeeping purge job
//!
//! Static sources register their configured hosts at start; dynamic
//! sources hand hosts out through a `HostListBackend` as their policy
//! grows the pool.

pub mod backend;
pub mod config;
pub mod context;

pub use backend::HostListBackend;
pub use config::FleetConfig;
pub use context::FleetContext;
