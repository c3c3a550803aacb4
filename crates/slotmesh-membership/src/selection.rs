//! Candidate ranking policies.
//!
//! Given the instances of a cluster that already passed the liveness
//! and minimum-slot filter, a mode orders them so index 0 is the most
//! preferred destination.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::status::InstanceStatus;

/// How to pick among several viable instances of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionMode {
    /// Most open slots first: spread users across the cluster.
    LoadBalancing,
    /// Fewest open slots (that still fit) first: pack instances before
    /// opening new ones.
    Matchmaking,
    /// Uniformly random order. Implemented as an explicit shuffle, not
    /// a randomized comparator — a comparator returning a random sign
    /// is not a uniform permutation under a general-purpose sort.
    Random,
}

impl SelectionMode {
    /// Order `candidates` in place, best first. The sort is stable, so
    /// ties keep their incoming order.
    pub fn order(self, candidates: &mut [InstanceStatus]) {
        match self {
            SelectionMode::LoadBalancing => {
                candidates.sort_by(|a, b| b.open_slots.cmp(&a.open_slots));
            }
            SelectionMode::Matchmaking => {
                candidates.sort_by(|a, b| a.open_slots.cmp(&b.open_slots));
            }
            SelectionMode::Random => {
                candidates.shuffle(&mut rand::thread_rng());
            }
        }
    }
}
