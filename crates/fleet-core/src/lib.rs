//! fleet-core — the single authority over node state.
//!
//! `RmCore` owns every `Node` (as an arena of slots keyed by `NodeId`) and
//! performs every lifecycle transition. Node sources register nodes into
//! it, clients reserve and release through it, the health monitor reports
//! unreachable nodes to it, and housekeeping asks it to purge stale ones.
//!
//! # Locking
//!
//! ```text
//! registry: RwLock<Registry>     structural changes (sources, insert/delete)
//!   └── NodeSlot: Mutex<NodeRecord>   per-node compare-and-set transitions
//! topology: RwLock<TopologyIndex>    rebuilt after membership changes
//! ```
//!
//! Lock order is registry, then slot. Topology rebuilds take the topology
//! lock and then read the registry; nothing waits for the topology lock
//! while holding the registry lock. Backend calls and reachability probes
//! run with no lock held; only their outcome is applied as a transition.

mod registry;
pub mod reservation;
pub mod rm_core;

pub use reservation::{Reservation, SelectionRequest};
pub use rm_core::{CoreSettings, RmCore};
