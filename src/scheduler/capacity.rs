use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::cluster::Cluster;
use crate::scheduler::HostAffinity;

/// Usable memory on one node, derived fresh for every decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capacity {
    pub hostname: String,
    pub total_mem: f64,
    pub free_mem: f64,
    pub cores: u32,
}

impl Capacity {
    /// Whole threads of the given per-thread cost that fit in free memory.
    pub fn threads_for(&self, cost_per_thread: f64) -> u32 {
        if cost_per_thread <= 0.0 || self.free_mem < cost_per_thread {
            return 0;
        }
        let mut threads = (self.free_mem / cost_per_thread).floor().min(u32::MAX as f64) as u32;
        while threads > 0 && f64::from(threads) * cost_per_thread > self.free_mem {
            threads -= 1;
        }
        threads
    }
}

/// Walk the node graph breadth-first from the root and report every node
/// we can run on. Nodes that cannot be escalated are skipped but still
/// traversed through.
pub fn discover(cluster: &dyn Cluster, root_reserved: f64) -> Vec<Capacity> {
    let root = cluster.root();
    let mut seen = HashSet::from([root.clone()]);
    let mut frontier = VecDeque::from([root.clone()]);
    let mut capacities = Vec::new();

    while let Some(host) = frontier.pop_front() {
        for neighbor in cluster.neighbors(&host) {
            if seen.insert(neighbor.clone()) {
                frontier.push_back(neighbor);
            }
        }

        if !cluster.escalate(&host) {
            tracing::trace!(host = %host, "Skipping node without privileges");
            continue;
        }
        let Some(memory) = cluster.memory(&host) else {
            continue;
        };

        let reserved = if host == root { root_reserved } else { 0.0 };
        capacities.push(Capacity {
            free_mem: (memory.total - memory.used - reserved).max(0.0),
            total_mem: memory.total,
            cores: memory.cores,
            hostname: host,
        });
    }

    capacities
}

/// Order (and for `MustRunOn`, filter) nodes by affinity. With no affinity
/// the root moves to the back.
pub fn apply_host_affinity(
    mut capacities: Vec<Capacity>,
    affinity: Option<&HostAffinity>,
    root: &str,
) -> Vec<Capacity> {
    match affinity {
        Some(HostAffinity::MustRunOn { host }) => {
            capacities.retain(|c| c.hostname == *host);
        }
        Some(HostAffinity::PreferToRunOn { host }) => {
            capacities.sort_by_key(|c| c.hostname != *host);
        }
        None => {
            capacities.sort_by_key(|c| c.hostname == root);
        }
    }
    capacities
}
