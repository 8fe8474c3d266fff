//! Node source policies — access rights and pool sizing.
//!
//! The static policy only carries access types; its nodes arrive through
//! explicit registration. The threshold policy also drives the acquisition
//! loop of a dynamic source:
//!
//! ```text
//! live = configuring + free + busy
//!
//! if live < min_nodes:                    Grow(min_nodes - live)
//! if free < min_free and live < max:      Grow(min(min_free - free, max - live))
//! idle = free nodes idle >= nice_time, longest idle first
//! if idle and live > min_nodes and free > min_free:
//!     Shrink(first min(live - min_nodes, free - min_free) of idle)
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use fleet_types::{AccessType, NodeId, NodeState};

/// Whether a source grows and shrinks on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Static,
    Dynamic,
}

/// One member of a source as seen by the policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolMember {
    pub id: NodeId,
    pub state: NodeState,
    /// Time spent in the current state.
    pub in_state_for: Duration,
}

/// Members of a source at a point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStatus {
    pub members: Vec<PoolMember>,
}

impl PoolStatus {
    /// Nodes that occupy a slot: configuring, free or busy.
    pub fn live(&self) -> usize {
        self.members
            .iter()
            .filter(|m| {
                matches!(
                    m.state,
                    NodeState::Configuring | NodeState::Free | NodeState::Busy
                )
            })
            .count()
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.members.iter().filter(|m| m.state == state).count()
    }
}

/// What the acquisition loop should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolDecision {
    /// Acquire this many nodes.
    Grow(usize),
    /// Retire these idle nodes.
    Shrink(Vec<NodeId>),
    NoChange,
}

pub trait NodeSourcePolicy: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Who may add nodes to the source.
    fn provider_access(&self) -> AccessType;

    /// Who may reserve nodes from the source.
    fn user_access(&self) -> AccessType;

    /// Decide how the pool should change.
    fn evaluate(&self, status: &PoolStatus) -> PoolDecision;

    /// Called when a member went down. Returns true to request an immediate
    /// replacement acquisition.
    fn on_node_down(&self, id: NodeId) -> bool;
}

// ── Static ─────────────────────────────────────────────────────────

/// A fixed pool; nodes come only from explicit registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticPolicy {
    pub user_access: AccessType,
    pub provider_access: AccessType,
}

impl StaticPolicy {
    pub fn new(user_access: AccessType, provider_access: AccessType) -> Self {
        Self {
            user_access,
            provider_access,
        }
    }
}

impl NodeSourcePolicy for StaticPolicy {
    fn kind(&self) -> SourceKind {
        SourceKind::Static
    }

    fn provider_access(&self) -> AccessType {
        self.provider_access
    }

    fn user_access(&self) -> AccessType {
        self.user_access
    }

    fn evaluate(&self, _status: &PoolStatus) -> PoolDecision {
        PoolDecision::NoChange
    }

    fn on_node_down(&self, _id: NodeId) -> bool {
        false
    }
}

// ── Threshold dynamic ──────────────────────────────────────────────

/// Keeps a dynamic pool between `min_nodes` and `max_nodes`, with at least
/// `min_free` free nodes, releasing free nodes idle beyond `nice_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdDynamicPolicy {
    pub min_nodes: usize,
    pub max_nodes: usize,
    pub min_free: usize,
    pub nice_time: Duration,
    pub user_access: AccessType,
    pub provider_access: AccessType,
}

impl ThresholdDynamicPolicy {
    pub fn new(min_nodes: usize, max_nodes: usize) -> Self {
        Self {
            min_nodes,
            max_nodes: max_nodes.max(min_nodes),
            min_free: 1,
            nice_time: Duration::from_secs(60),
            user_access: AccessType::All,
            provider_access: AccessType::OwnerOnly,
        }
    }

    pub fn with_min_free(mut self, min_free: usize) -> Self {
        self.min_free = min_free;
        self
    }

    pub fn with_nice_time(mut self, nice_time: Duration) -> Self {
        self.nice_time = nice_time;
        self
    }

    pub fn with_access(mut self, user_access: AccessType, provider_access: AccessType) -> Self {
        self.user_access = user_access;
        self.provider_access = provider_access;
        self
    }
}

impl NodeSourcePolicy for ThresholdDynamicPolicy {
    fn kind(&self) -> SourceKind {
        SourceKind::Dynamic
    }

    fn provider_access(&self) -> AccessType {
        self.provider_access
    }

    fn user_access(&self) -> AccessType {
        self.user_access
    }

    fn evaluate(&self, status: &PoolStatus) -> PoolDecision {
        let live = status.live();
        let free = status.count(NodeState::Free);

        if live < self.min_nodes {
            let grow = (self.min_nodes - live).min(self.max_nodes.saturating_sub(live));
            debug!(live, min = self.min_nodes, grow, "pool below minimum");
            return PoolDecision::Grow(grow);
        }

        if free < self.min_free && live < self.max_nodes {
            let grow = (self.min_free - free).min(self.max_nodes - live);
            debug!(live, free, min_free = self.min_free, grow, "pool short of free nodes");
            return PoolDecision::Grow(grow);
        }

        let mut idle: Vec<&PoolMember> = status
            .members
            .iter()
            .filter(|m| m.state == NodeState::Free && m.in_state_for >= self.nice_time)
            .collect();
        let allowed = (live - self.min_nodes).min(free.saturating_sub(self.min_free));
        if idle.is_empty() || allowed == 0 {
            return PoolDecision::NoChange;
        }

        idle.sort_by(|a, b| b.in_state_for.cmp(&a.in_state_for));
        let retire: Vec<NodeId> = idle.into_iter().take(allowed).map(|m| m.id).collect();
        debug!(live, free, retire = retire.len(), "pool has idle nodes past nice time");
        PoolDecision::Shrink(retire)
    }

    fn on_node_down(&self, _id: NodeId) -> bool {
        true
    }
}
