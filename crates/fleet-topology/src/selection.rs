//! Selection policies — order candidate nodes for a reservation.
//!
//! Every policy returns a subsequence of the candidates of length
//! `min(count, candidates.len())`. Policies never invent or duplicate nodes;
//! the registry relies on that when it marks the result busy.

use std::str::FromStr;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use fleet_types::{Client, NodeId};

use crate::index::TopologyIndex;

/// What a policy may look at besides the candidate list.
pub struct SelectionContext<'a> {
    /// The requesting client.
    pub client: &'a Client,
    /// Nodes the client already holds.
    pub owned: &'a [NodeId],
    /// Current proximity clustering.
    pub topology: &'a TopologyIndex,
}

pub trait SelectionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick and order at most `count` of `candidates`.
    fn arrange(&self, count: usize, candidates: &[NodeId], ctx: &SelectionContext<'_>)
    -> Vec<NodeId>;
}

/// Keeps the registration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArbitraryPolicy;

impl SelectionPolicy for ArbitraryPolicy {
    fn name(&self) -> &'static str {
        "arbitrary"
    }

    fn arrange(&self, count: usize, candidates: &[NodeId], _ctx: &SelectionContext<'_>) -> Vec<NodeId> {
        candidates.iter().take(count).copied().collect()
    }
}

/// Uniformly random permutation, for load balancing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShufflePolicy;

impl SelectionPolicy for ShufflePolicy {
    fn name(&self) -> &'static str {
        "shuffle"
    }

    fn arrange(&self, count: usize, candidates: &[NodeId], _ctx: &SelectionContext<'_>) -> Vec<NodeId> {
        let mut out = candidates.to_vec();
        out.shuffle(&mut rand::thread_rng());
        out.truncate(count);
        out
    }
}

/// Prefers nodes close to the ones the client already owns.
///
/// Candidates sharing a cluster with an owned node come first, then the
/// rest by ascending distance to the nearest owned node. Nodes with no
/// known distance go last. Ties keep registration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct AffinityPolicy;

impl SelectionPolicy for AffinityPolicy {
    fn name(&self) -> &'static str {
        "affinity"
    }

    fn arrange(&self, count: usize, candidates: &[NodeId], ctx: &SelectionContext<'_>) -> Vec<NodeId> {
        let mut out = candidates.to_vec();
        if !ctx.owned.is_empty() {
            out.sort_by_key(|candidate| {
                let shares_cluster = ctx
                    .owned
                    .iter()
                    .any(|owned| ctx.topology.same_cluster(*candidate, *owned));
                let nearest = ctx
                    .owned
                    .iter()
                    .filter_map(|owned| ctx.topology.distance(*candidate, *owned))
                    .min()
                    .unwrap_or(u64::MAX);
                (!shares_cluster, nearest)
            });
        }
        out.truncate(count);
        out
    }
}

/// The built-in policies, selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicyKind {
    #[default]
    Arbitrary,
    Shuffle,
    Affinity,
}

impl SelectionPolicy for SelectionPolicyKind {
    fn name(&self) -> &'static str {
        match self {
            SelectionPolicyKind::Arbitrary => ArbitraryPolicy.name(),
            SelectionPolicyKind::Shuffle => ShufflePolicy.name(),
            SelectionPolicyKind::Affinity => AffinityPolicy.name(),
        }
    }

    fn arrange(&self, count: usize, candidates: &[NodeId], ctx: &SelectionContext<'_>) -> Vec<NodeId> {
        match self {
            SelectionPolicyKind::Arbitrary => ArbitraryPolicy.arrange(count, candidates, ctx),
            SelectionPolicyKind::Shuffle => ShufflePolicy.arrange(count, candidates, ctx),
            SelectionPolicyKind::Affinity => AffinityPolicy.arrange(count, candidates, ctx),
        }
    }
}

impl FromStr for SelectionPolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arbitrary" | "default" => Ok(SelectionPolicyKind::Arbitrary),
            "shuffle" | "random" => Ok(SelectionPolicyKind::Shuffle),
            "affinity" | "colocate" => Ok(SelectionPolicyKind::Affinity),
            other => Err(format!("unknown selection policy: {other}")),
        }
    }
}
