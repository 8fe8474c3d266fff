//! Topology index — groups nodes by proximity.
//!
//! `rebuild` recomputes everything from scratch: every pair of nodes is
//! measured once (O(n²) metric calls and memory for the distance map) and
//! nodes closer than the threshold are merged with single linkage. The
//! registry calls it on membership changes, which are rare compared to
//! reservations.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use fleet_types::{NodeId, NodeInfo};

use crate::cluster::Cluster;
use crate::metric::ProximityMetric;

/// Locality requirement attached to a reservation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyConstraint {
    /// No locality requirement.
    #[default]
    Arbitrary,
    /// Prefer nodes from a single proximity group.
    CoLocate,
    /// Prefer nodes from as many different groups as possible.
    Spread,
}

/// Proximity clustering of the registered nodes.
#[derive(Debug, Clone)]
pub struct TopologyIndex {
    threshold: u64,
    clusters: Vec<Cluster<NodeId>>,
    membership: HashMap<NodeId, usize>,
    distances: HashMap<(NodeId, NodeId), u64>,
}

impl TopologyIndex {
    /// Create an empty index. Nodes closer than `threshold` share a cluster.
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            clusters: Vec::new(),
            membership: HashMap::new(),
            distances: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn clusters(&self) -> &[Cluster<NodeId>] {
        &self.clusters
    }

    /// Recompute clusters for `nodes`. Cluster ids and element order follow
    /// the input order.
    pub fn rebuild(&mut self, nodes: &[(NodeId, NodeInfo)], metric: &dyn ProximityMetric) {
        let n = nodes.len();
        let mut parent: Vec<usize> = (0..n).collect();
        let mut distances = HashMap::new();

        for i in 0..n {
            for j in (i + 1)..n {
                let Some(d) = metric.distance(&nodes[i].1, &nodes[j].1) else {
                    continue;
                };
                distances.insert(pair_key(nodes[i].0, nodes[j].0), d);
                if d < self.threshold {
                    union(&mut parent, i, j);
                }
            }
        }

        let mut clusters: Vec<Cluster<NodeId>> = Vec::new();
        let mut root_to_cluster: HashMap<usize, usize> = HashMap::new();
        let mut membership = HashMap::with_capacity(n);

        for (i, (id, _)) in nodes.iter().enumerate() {
            let root = find(&mut parent, i);
            let idx = *root_to_cluster.entry(root).or_insert_with(|| {
                clusters.push(Cluster::new(format!("cluster-{}", clusters.len())));
                clusters.len() - 1
            });
            clusters[idx].add([*id]);
            membership.insert(*id, idx);
        }

        debug!(
            nodes = n,
            clusters = clusters.len(),
            threshold = self.threshold,
            "topology rebuilt"
        );

        self.clusters = clusters;
        self.membership = membership;
        self.distances = distances;
    }

    /// The cluster a node belongs to, if the node is indexed.
    pub fn cluster_of(&self, id: NodeId) -> Option<&Cluster<NodeId>> {
        self.membership.get(&id).map(|&idx| &self.clusters[idx])
    }

    /// Whether two nodes are in the same cluster.
    pub fn same_cluster(&self, a: NodeId, b: NodeId) -> bool {
        match (self.membership.get(&a), self.membership.get(&b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    /// Measured distance between two nodes at the last rebuild.
    pub fn distance(&self, a: NodeId, b: NodeId) -> Option<u64> {
        if a == b {
            return Some(0);
        }
        self.distances.get(&pair_key(a, b)).copied()
    }

    /// Narrow `candidates` to at most `count` nodes honoring `constraint`.
    ///
    /// Candidates keep their relative order inside each group. Nodes the
    /// index does not know form their own single-node group.
    pub fn arrange(
        &self,
        count: usize,
        candidates: &[NodeId],
        constraint: TopologyConstraint,
    ) -> Vec<NodeId> {
        let mut out = match constraint {
            TopologyConstraint::Arbitrary => candidates.to_vec(),
            TopologyConstraint::CoLocate => {
                let mut groups = self.group(candidates);
                // Best fit: the smallest group that can satisfy the request
                // on its own, otherwise the largest groups first.
                let fitting = groups
                    .iter()
                    .filter(|g| g.len() >= count)
                    .min_by_key(|g| g.len())
                    .cloned();
                match fitting {
                    Some(group) => group,
                    None => {
                        groups.sort_by(|a, b| b.len().cmp(&a.len()));
                        groups.into_iter().flatten().collect()
                    }
                }
            }
            TopologyConstraint::Spread => {
                let groups = self.group(candidates);
                let mut out = Vec::with_capacity(candidates.len());
                let mut round = 0;
                while out.len() < candidates.len() {
                    for group in &groups {
                        if let Some(id) = group.get(round) {
                            out.push(*id);
                        }
                    }
                    round += 1;
                }
                out
            }
        };
        out.truncate(count);
        out
    }

    /// Group candidates by cluster, in order of first appearance.
    fn group(&self, candidates: &[NodeId]) -> Vec<Vec<NodeId>> {
        let mut groups: Vec<Vec<NodeId>> = Vec::new();
        let mut by_cluster: HashMap<usize, usize> = HashMap::new();
        for id in candidates {
            match self.membership.get(id) {
                Some(&cluster) => {
                    let slot = *by_cluster.entry(cluster).or_insert_with(|| {
                        groups.push(Vec::new());
                        groups.len() - 1
                    });
                    groups[slot].push(*id);
                }
                None => groups.push(vec![*id]),
            }
        }
        groups
    }
}

fn pair_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b { (a, b) } else { (b, a) }
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra != rb {
        // Keep the lowest index as root so cluster order follows input order.
        let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
        parent[hi] = lo;
    }
}
