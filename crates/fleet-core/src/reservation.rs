//! Reservation requests and results.

use std::sync::Arc;

use fleet_topology::{SelectionPolicy, SelectionPolicyKind, TopologyConstraint};
use fleet_types::{Client, NodeId};

/// A client's request for nodes.
#[derive(Clone)]
pub struct SelectionRequest {
    pub client: Client,
    pub count: usize,
    pub policy: Arc<dyn SelectionPolicy>,
    pub constraint: TopologyConstraint,
}

impl SelectionRequest {
    /// Request `count` nodes in registration order, without locality.
    pub fn new(client: Client, count: usize) -> Self {
        Self {
            client,
            count,
            policy: Arc::new(SelectionPolicyKind::Arbitrary),
            constraint: TopologyConstraint::Arbitrary,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn SelectionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_constraint(mut self, constraint: TopologyConstraint) -> Self {
        self.constraint = constraint;
        self
    }
}

impl std::fmt::Debug for SelectionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionRequest")
            .field("client", &self.client.name)
            .field("count", &self.count)
            .field("policy", &self.policy.name())
            .field("constraint", &self.constraint)
            .finish()
    }
}

/// Outcome of a reservation. Both variants hold nodes that are now busy
/// and owned by the requesting client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// Every requested node was reserved.
    Full(Vec<NodeId>),
    /// Fewer nodes were available than requested. The caller decides
    /// whether to proceed or release them.
    Partial { nodes: Vec<NodeId>, requested: usize },
}

impl Reservation {
    pub fn nodes(&self) -> &[NodeId] {
        match self {
            Reservation::Full(nodes) => nodes,
            Reservation::Partial { nodes, .. } => nodes,
        }
    }

    pub fn into_nodes(self) -> Vec<NodeId> {
        match self {
            Reservation::Full(nodes) => nodes,
            Reservation::Partial { nodes, .. } => nodes,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Reservation::Partial { .. })
    }

    pub fn len(&self) -> usize {
        self.nodes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes().is_empty()
    }
}
