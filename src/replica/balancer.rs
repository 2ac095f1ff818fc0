//! Load-balancing strategies for selecting among healthy replicas
//! (`spec.md` §4.12).
//!
//! Round-robin/random/weighted selection is grounded on the driver's own
//! use of `rand` for connection-jitter scheduling
//! (`get-convex-convex-backend` pulls `rand` transitively for exactly this
//! kind of scatter); smooth-weighted round-robin follows the well-known
//! "current weight" algorithm (as used by nginx/LVS) rather than plain
//! weighted-random, since `spec.md` calls the two out as distinct
//! strategies.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::Rng;

use crate::{config::LoadBalanceMode, error::Error};

use super::info::ReplicaInfo;

/// Smooth-weighted round robin's per-replica mutable state (`spec.md`
/// §4.12): every selection adds each candidate's weight to its current
/// weight, picks the max, then subtracts the total weight from the
/// winner.
struct SmoothWeightedState {
    current_weights: Vec<i64>,
}

pub struct LoadBalancer {
    mode: Mutex<LoadBalanceMode>,
    round_robin_cursor: AtomicU64,
    smooth_weighted: Mutex<SmoothWeightedState>,
}

impl LoadBalancer {
    pub fn new(mode: LoadBalanceMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            round_robin_cursor: AtomicU64::new(0),
            smooth_weighted: Mutex::new(SmoothWeightedState {
                current_weights: Vec::new(),
            }),
        }
    }

    pub fn set_mode(&self, mode: LoadBalanceMode) {
        *self.mode.lock() = mode;
    }

    pub fn mode(&self) -> LoadBalanceMode {
        *self.mode.lock()
    }

    /// Picks an index into `candidates` (already filtered to available
    /// replicas by the caller) according to the current strategy.
    pub fn select<'a>(&self, candidates: &'a [&'a ReplicaInfo]) -> Result<&'a ReplicaInfo, Error> {
        if candidates.is_empty() {
            return Err(Error::NoHealthyReplicas);
        }
        let idx = match self.mode() {
            LoadBalanceMode::RoundRobin => self.select_round_robin(candidates.len()),
            LoadBalanceMode::Random => rand::rng().random_range(0..candidates.len()),
            LoadBalanceMode::Weighted => self.select_weighted(candidates),
            LoadBalanceMode::SmoothWeighted => self.select_smooth_weighted(candidates),
            LoadBalanceMode::Latency => self.select_lowest_latency(candidates),
            LoadBalanceMode::LeastConnections => self.select_least_connections(candidates),
        };
        Ok(candidates[idx])
    }

    fn select_round_robin(&self, len: usize) -> usize {
        let n = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed);
        (n as usize) % len
    }

    fn select_weighted(&self, candidates: &[&ReplicaInfo]) -> usize {
        let total: u64 = candidates.iter().map(|c| c.descriptor.weight as u64).sum();
        if total == 0 {
            return 0;
        }
        let mut target = rand::rng().random_range(0..total);
        for (idx, candidate) in candidates.iter().enumerate() {
            let weight = candidate.descriptor.weight as u64;
            if target < weight {
                return idx;
            }
            target -= weight;
        }
        candidates.len() - 1
    }

    fn select_smooth_weighted(&self, candidates: &[&ReplicaInfo]) -> usize {
        let mut state = self.smooth_weighted.lock();
        if state.current_weights.len() != candidates.len() {
            state.current_weights = vec![0; candidates.len()];
        }
        let total_weight: i64 = candidates.iter().map(|c| c.descriptor.weight as i64).sum();
        for (i, candidate) in candidates.iter().enumerate() {
            state.current_weights[i] += candidate.descriptor.weight as i64;
        }
        let (best_idx, _) = state
            .current_weights
            .iter()
            .enumerate()
            .max_by_key(|(_, w)| **w)
            .expect("candidates is non-empty");
        state.current_weights[best_idx] -= total_weight;
        best_idx
    }

    /// `spec.md` §4.12: "treat zeros specially — both-zero tie-break by
    /// success rate; single-zero loses; otherwise lowest wins". A zero EMA
    /// means the replica has never recorded a sample, so a bare latency
    /// comparison would wrongly treat "no data" as "fastest".
    fn select_lowest_latency(&self, candidates: &[&ReplicaInfo]) -> usize {
        let zero = std::time::Duration::ZERO;
        candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                let (la, lb) = (a.latency_ema(), b.latency_ema());
                match (la == zero, lb == zero) {
                    (true, true) => b.success_rate().total_cmp(&a.success_rate()),
                    (true, false) => std::cmp::Ordering::Greater,
                    (false, true) => std::cmp::Ordering::Less,
                    (false, false) => la.cmp(&lb),
                }
            })
            .map(|(idx, _)| idx)
            .expect("candidates is non-empty")
    }

    fn select_least_connections(&self, candidates: &[&ReplicaInfo]) -> usize {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.in_flight())
            .map(|(idx, _)| idx)
            .expect("candidates is non-empty")
    }
}
