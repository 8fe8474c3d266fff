//! Domain types for nodes and their lifecycle.
//!
//! These types are shared between the registry, the node sources, and the
//! background monitors. Serializable types are the ones that cross the
//! administrative surface (snapshots, node views).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::client::Client;

/// Name of a node source.
pub type SourceName = String;

/// Stable identifier of a registered node.
///
/// Ids are allocated from a monotonic counter, so ordering by id is
/// registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

// ── Node state ─────────────────────────────────────────────────────

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Registered, waiting for the reachability confirmation.
    Configuring,
    /// Usable and unowned.
    Free,
    /// Reserved by a client.
    Busy,
    /// Failed health probes.
    Down,
    /// Scheduled for deletion from the registry.
    ToRemove,
    /// Owning source was removed.
    Lost,
}

impl NodeState {
    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Configuring, Free)
                | (Configuring, Down)
                | (Configuring, Lost)
                | (Free, Busy)
                | (Busy, Free)
                | (Free, Down)
                | (Busy, Down)
                | (Down, ToRemove)
                | (Free, ToRemove)
                | (Busy, ToRemove)
                | (Free, Lost)
                | (Busy, Lost)
                | (Down, Lost)
        )
    }

    /// Whether a node in this state is about to disappear from the registry.
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::ToRemove | NodeState::Lost)
    }

    /// Whether a node in this state counts as alive (reachable and usable).
    pub fn is_alive(self) -> bool {
        matches!(self, NodeState::Free | NodeState::Busy)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Configuring => "configuring",
            NodeState::Free => "free",
            NodeState::Busy => "busy",
            NodeState::Down => "down",
            NodeState::ToRemove => "to_remove",
            NodeState::Lost => "lost",
        };
        f.write_str(s)
    }
}

// ── Host metadata ──────────────────────────────────────────────────

/// Host metadata reported by a node handle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Host name (or address) the node runs on.
    pub hostname: String,
    /// Number of task slots the node offers.
    pub capacity: u32,
}

impl NodeInfo {
    pub fn new(hostname: impl Into<String>, capacity: u32) -> Self {
        Self {
            hostname: hostname.into(),
            capacity,
        }
    }
}

/// Read-only view of a registered node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    pub id: NodeId,
    pub url: String,
    pub source: SourceName,
    pub state: NodeState,
    pub owner: Option<Client>,
    pub info: NodeInfo,
    pub locked: bool,
}

// ── Snapshot ───────────────────────────────────────────────────────

/// Node counts per state, for external reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub configuring: usize,
    pub free: usize,
    pub busy: usize,
    pub down: usize,
}

impl FleetSnapshot {
    /// Count one node in the given state. Nodes on their way out are not
    /// reported.
    pub fn record(&mut self, state: NodeState) {
        match state {
            NodeState::Configuring => self.configuring += 1,
            NodeState::Free => self.free += 1,
            NodeState::Busy => self.busy += 1,
            NodeState::Down => self.down += 1,
            NodeState::ToRemove | NodeState::Lost => {}
        }
    }

    pub fn total(&self) -> usize {
        self.configuring + self.free + self.busy + self.down
    }
}
