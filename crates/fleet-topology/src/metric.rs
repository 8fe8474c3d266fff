//! Proximity metrics between hosts.
//!
//! A metric returns a non-negative distance between two nodes, or `None`
//! when the distance is unknown. Smaller is closer; the same host is 0.

use std::collections::HashMap;
use std::net::IpAddr;

use fleet_types::NodeInfo;

pub trait ProximityMetric: Send + Sync {
    fn distance(&self, a: &NodeInfo, b: &NodeInfo) -> Option<u64>;
}

/// Distance derived from host names.
///
/// For DNS names the distance is the number of labels that differ once the
/// common suffix is stripped: `n1.rack1.dc` and `n2.rack1.dc` are 1 apart,
/// `n1.rack2.dc` is 2 away from both. IPv4 addresses on the same /24 are 1
/// apart, other addresses 2.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostnameProximity;

impl ProximityMetric for HostnameProximity {
    fn distance(&self, a: &NodeInfo, b: &NodeInfo) -> Option<u64> {
        let (ha, hb) = (a.hostname.as_str(), b.hostname.as_str());
        if ha.eq_ignore_ascii_case(hb) {
            return Some(0);
        }

        if let (Ok(ia), Ok(ib)) = (ha.parse::<IpAddr>(), hb.parse::<IpAddr>()) {
            return Some(match (ia, ib) {
                (IpAddr::V4(x), IpAddr::V4(y)) if x.octets()[..3] == y.octets()[..3] => 1,
                _ => 2,
            });
        }

        let la: Vec<String> = ha.rsplit('.').map(str::to_ascii_lowercase).collect();
        let lb: Vec<String> = hb.rsplit('.').map(str::to_ascii_lowercase).collect();
        let common = la.iter().zip(&lb).take_while(|(x, y)| x == y).count();
        Some((la.len().max(lb.len()) - common) as u64)
    }
}

/// Explicitly measured distances between hosts, such as ping latencies.
#[derive(Debug, Clone, Default)]
pub struct DistanceTable {
    distances: HashMap<(String, String), u64>,
}

impl DistanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a symmetric distance between two hosts.
    pub fn insert(&mut self, a: &str, b: &str, distance: u64) {
        self.distances.insert(Self::key(a, b), distance);
    }

    pub fn with(mut self, a: &str, b: &str, distance: u64) -> Self {
        self.insert(a, b, distance);
        self
    }

    fn key(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }
}

impl ProximityMetric for DistanceTable {
    fn distance(&self, a: &NodeInfo, b: &NodeInfo) -> Option<u64> {
        if a.hostname == b.hostname {
            return Some(0);
        }
        self.distances.get(&Self::key(&a.hostname, &b.hostname)).copied()
    }
}
