//! Proximity grouping and selection policies for node reservation.
//!
//! This crate holds no I/O and no locks. The core registry owns a
//! `TopologyIndex`, rebuilds it when membership changes, and consults it
//! together with a `SelectionPolicy` when a client reserves nodes.
//!
//! # Components
//!
//! - **`cluster`** — `Cluster<E>`, an identified ordered group of elements
//! - **`metric`** — proximity metrics (`HostnameProximity`, `DistanceTable`)
//! - **`index`** — `TopologyIndex` (threshold clustering, locality constraints)
//! - **`selection`** — `SelectionPolicy` variants (arbitrary, shuffle, affinity)

pub mod cluster;
pub mod index;
pub mod metric;
pub mod selection;

pub use cluster::Cluster;
pub use index::{TopologyConstraint, TopologyIndex};
pub use metric::{DistanceTable, HostnameProximity, ProximityMetric};
pub use selection::{
    AffinityPolicy, ArbitraryPolicy, SelectionContext, SelectionPolicy, SelectionPolicyKind,
    ShufflePolicy,
};
