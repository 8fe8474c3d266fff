//! Node sources — named pools of nodes from one provisioning backend.
//!
//! A `NodeSource` binds an `InfrastructureBackend` (how nodes are acquired
//! and terminated) to a `NodeSourcePolicy` (who may use them, and for
//! dynamic pools when to grow or shrink). It stores only node ids; the
//! registry owns the nodes and is reached through the `NodeRegistrar` seam.
//!
//! # Architecture
//!
//! ```text
//! NodeSource
//!   ├── InfrastructureBackend (acquire / terminate, with timeouts)
//!   ├── NodeSourcePolicy (access types, grow/shrink decisions)
//!   ├── member ids
//!   └── acquisition loop (dynamic sources only)
//!       ├── NodeRegistrar::pool_status → PoolDecision
//!       ├── Grow  → backend.acquire() → NodeRegistrar::register_node
//!       └── Shrink → NodeRegistrar::retire_node
//! ```
//!
//! Failed acquisitions are retried with exponential backoff up to a bounded
//! number of attempts, then raised as a source alert. They never reach the
//! registry as errors.

pub mod backend;
pub mod policy;
pub mod registrar;
pub mod source;

pub use backend::InfrastructureBackend;
pub use policy::{
    NodeSourcePolicy, PoolDecision, PoolMember, PoolStatus, SourceKind, StaticPolicy,
    ThresholdDynamicPolicy,
};
pub use registrar::NodeRegistrar;
pub use source::{NodeSource, SourceAlert, SourceSettings};
