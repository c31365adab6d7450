use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::state::ConnectionTracker;
use crate::error::RouterError;
use crate::registry::Service;

/// Selection policy names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    IpHash,
    Random,
}

impl Algorithm {
    pub const ALL: [Algorithm; 5] = [
        Algorithm::RoundRobin,
        Algorithm::WeightedRoundRobin,
        Algorithm::LeastConnections,
        Algorithm::IpHash,
        Algorithm::Random,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::WeightedRoundRobin => "weighted_round_robin",
            Algorithm::LeastConnections => "least_connections",
            Algorithm::IpHash => "ip_hash",
            Algorithm::Random => "random",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Algorithm::ALL
            .into_iter()
            .find(|a| a.as_str() == s.trim())
            .ok_or_else(|| RouterError::invalid_algorithm(s))
    }
}

/// Inputs beyond the candidate list that some strategies consult
pub struct SelectionContext<'a> {
    pub client_ip: Option<IpAddr>,
    /// Weight overrides keyed by service id
    pub weights: &'a HashMap<String, u32>,
    pub connections: &'a ConnectionTracker,
}

impl SelectionContext<'_> {
    fn weight_of(&self, service: &Service) -> u32 {
        self.weights
            .get(&service.id)
            .copied()
            .unwrap_or(service.weight)
            .max(1)
    }
}

/// A replaceable selection policy: pick one of N candidates
pub trait BalancingAlgorithm: Send + Sync {
    fn kind(&self) -> Algorithm;

    /// Index into `candidates`, or None when it is empty
    fn select(&self, candidates: &[Service], ctx: &SelectionContext<'_>) -> Option<usize>;

    /// Clear cursors and counters
    fn reset(&self);
}

/// Build a fresh strategy with zeroed state
pub fn create(algorithm: Algorithm) -> Arc<dyn BalancingAlgorithm> {
    match algorithm {
        Algorithm::RoundRobin => Arc::new(RoundRobin::default()),
        Algorithm::WeightedRoundRobin => Arc::new(WeightedRoundRobin::default()),
        Algorithm::LeastConnections => Arc::new(LeastConnections),
        Algorithm::IpHash => Arc::new(IpHash),
        Algorithm::Random => Arc::new(RandomSelect),
    }
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl BalancingAlgorithm for RoundRobin {
    fn kind(&self) -> Algorithm {
        Algorithm::RoundRobin
    }

    fn select(&self, candidates: &[Service], _ctx: &SelectionContext<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let position = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(position % candidates.len())
    }

    fn reset(&self) {
        self.cursor.store(0, Ordering::Relaxed);
    }
}

/// Smooth weighted round robin: over any run of `sum(weights)` selections
/// each service is picked exactly `weight` times, interleaved rather than
/// in bursts.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    current_weights: Mutex<HashMap<String, i64>>,
}

impl BalancingAlgorithm for WeightedRoundRobin {
    fn kind(&self) -> Algorithm {
        Algorithm::WeightedRoundRobin
    }

    fn select(&self, candidates: &[Service], ctx: &SelectionContext<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        if candidates.len() == 1 {
            return Some(0);
        }

        let mut current = self
            .current_weights
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Forget services that left the candidate set
        current.retain(|id, _| candidates.iter().any(|c| &c.id == id));

        let mut total: i64 = 0;
        let mut best: Option<(usize, i64)> = None;
        for (index, service) in candidates.iter().enumerate() {
            let weight = ctx.weight_of(service) as i64;
            total += weight;
            let slot = current.entry(service.id.clone()).or_insert(0);
            *slot += weight;
            if best.map_or(true, |(_, w)| *slot > w) {
                best = Some((index, *slot));
            }
        }

        let (index, _) = best?;
        if let Some(slot) = current.get_mut(&candidates[index].id) {
            *slot -= total;
        }
        Some(index)
    }

    fn reset(&self) {
        self.current_weights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Fewest in-flight requests wins; ties go to the earliest candidate
#[derive(Debug, Default)]
pub struct LeastConnections;

impl BalancingAlgorithm for LeastConnections {
    fn kind(&self) -> Algorithm {
        Algorithm::LeastConnections
    }

    fn select(&self, candidates: &[Service], ctx: &SelectionContext<'_>) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(index, s)| (ctx.connections.active(&s.id), *index))
            .map(|(index, _)| index)
    }

    fn reset(&self) {}
}

/// Client address hash modulo candidate count
#[derive(Debug, Default)]
pub struct IpHash;

impl IpHash {
    /// Polynomial string hash, stable across processes and restarts
    pub fn hash(input: &str) -> u64 {
        input
            .bytes()
            .fold(0u64, |h, b| h.wrapping_mul(31).wrapping_add(b as u64))
    }
}

impl BalancingAlgorithm for IpHash {
    fn kind(&self) -> Algorithm {
        Algorithm::IpHash
    }

    fn select(&self, candidates: &[Service], ctx: &SelectionContext<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let key = ctx.client_ip.map(|ip| ip.to_string()).unwrap_or_default();
        Some((Self::hash(&key) % candidates.len() as u64) as usize)
    }

    fn reset(&self) {}
}

#[derive(Debug, Default)]
pub struct RandomSelect;

impl BalancingAlgorithm for RandomSelect {
    fn kind(&self) -> Algorithm {
        Algorithm::Random
    }

    fn select(&self, candidates: &[Service], _ctx: &SelectionContext<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..candidates.len()))
    }

    fn reset(&self) {}
}
