//! Choosing a node among placement candidates.

use std::fmt;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::addressable::AddressableReference;
use crate::cluster::{NodeId, NodeInfo};

/// Picks the node for a new activation.
///
/// Candidates arrive already filtered for eligibility.
pub trait RoutingStrategy: Send + Sync + fmt::Debug {
    fn select(&self, reference: &AddressableReference, candidates: &[NodeInfo]) -> Option<NodeId>;
}

/// Uniformly random choice.
///
/// Candidates are ordered by id before drawing, so a seeded instance picks
/// the same sequence of nodes for the same candidate sets.
pub struct RandomRouting {
    rng: Mutex<StdRng>,
}

impl RandomRouting {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomRouting {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RandomRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RandomRouting").finish_non_exhaustive()
    }
}

impl RoutingStrategy for RandomRouting {
    fn select(&self, _reference: &AddressableReference, candidates: &[NodeInfo]) -> Option<NodeId> {
        if candidates.is_empty() {
            return None;
        }

        let mut ids: Vec<&NodeId> = candidates.iter().map(|info| &info.id).collect();
        ids.sort();

        let index = match self.rng.lock() {
            Ok(mut rng) => rng.random_range(0..ids.len()),
            // A poisoned lock still holds a usable generator.
            Err(poisoned) => poisoned.into_inner().random_range(0..ids.len()),
        };
        Some(ids[index].clone())
    }
}
