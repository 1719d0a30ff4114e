use rand::seq::SliceRandom;
use rand::Rng;

use crate::scheduler::capacity::{apply_host_affinity, Capacity};
use crate::scheduler::HostAffinity;

/// Threads placed on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub hostname: String,
    pub threads: u32,
}

/// Order candidate nodes for a job of `threads` threads.
///
/// Nodes that cannot fit one thread are dropped. The rest are shuffled,
/// then stably sorted so nodes holding the whole job come first, each group
/// smallest-first. Affinity is applied last.
pub fn rank<R: Rng + ?Sized>(
    capacities: Vec<Capacity>,
    threads: u32,
    cost_per_thread: f64,
    affinity: Option<&HostAffinity>,
    root: &str,
    rng: &mut R,
) -> Vec<Capacity> {
    let mut candidates: Vec<Capacity> = capacities
        .into_iter()
        .filter(|c| c.threads_for(cost_per_thread) > 0)
        .collect();

    candidates.shuffle(rng);
    candidates.sort_by(|a, b| {
        let a_fits = a.threads_for(cost_per_thread) >= threads;
        let b_fits = b.threads_for(cost_per_thread) >= threads;
        b_fits
            .cmp(&a_fits)
            .then(a.free_mem.total_cmp(&b.free_mem))
    });

    apply_host_affinity(candidates, affinity, root)
}

/// Walk `ranked` and give each node `min(fits, remaining)` threads through
/// `launch`. A node whose launch fails is skipped and the remainder moves
/// on. Returns the number of threads placed.
pub fn place<F>(ranked: &[Capacity], threads: u32, cost_per_thread: f64, mut launch: F) -> u32
where
    F: FnMut(&Capacity, u32) -> bool,
{
    let mut remaining = threads;
    for node in ranked {
        if remaining == 0 {
            break;
        }
        let take = node.threads_for(cost_per_thread).min(remaining);
        if take > 0 && launch(node, take) {
            remaining -= take;
        }
    }
    threads - remaining
}

/// Dry run of [`rank`] + [`place`] assuming every launch succeeds.
pub fn plan<R: Rng + ?Sized>(
    capacities: Vec<Capacity>,
    threads: u32,
    cost_per_thread: f64,
    affinity: Option<&HostAffinity>,
    root: &str,
    rng: &mut R,
) -> Vec<Placement> {
    let ranked = rank(capacities, threads, cost_per_thread, affinity, root, rng);
    let mut placements = Vec::new();
    place(&ranked, threads, cost_per_thread, |node, take| {
        placements.push(Placement {
            hostname: node.hostname.clone(),
            threads: take,
        });
        true
    });
    placements
}
