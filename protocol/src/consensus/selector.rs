//! # Leader Selector
//!
//! Turns a registry snapshot into a ranked list of node ids. The ranking,
//! repeated cyclically, becomes the epoch's leader schedule.
//!
//! ## The objective
//!
//! Ranking is posed as a QUBO (quadratic unconstrained binary optimization)
//! over the permutation matrix `x[i][p]` = "node `i` sits at position `p`":
//!
//! ```text
//! E(x) = Σ_i Σ_p  −score(i) · w(p) · x[i][p]                    (linear)
//!      + λ Σ_p Σ_{i,j} sim(i, j) · x[i][p] · x[j][p+1]           (quadratic)
//! ```
//!
//! - `score(i)` is the composite node score: uptime and throughput pull it
//!   up, latency and proposal-failure ratio pull it down.
//! - `w(p) = 1 − p/n` is strictly decreasing, so the linear part alone is
//!   minimized by sorting on score (rearrangement inequality).
//! - `sim(i, j)` is 1 for identical scores, fading to 0 at
//!   `similarity_threshold`. Placing near-twins back to back costs `λ`
//!   (`diversity_weight`), which spreads similar nodes across successive
//!   slots instead of letting one cluster of look-alikes hog a run of them.
//!
//! The one-hot constraints of the permutation matrix are never violated
//! because the annealer only ever *swaps* two positions. Penalty terms for
//! them would always be zero, so they are not computed.
//!
//! ## The optimizer
//!
//! Plain classical simulated annealing. No quantum hardware was harmed.
//! Start from the weighted sort, propose random swaps, accept downhill
//! always and uphill with probability `exp(−Δ/T)`, cool geometrically,
//! return the best state seen. Because the start state *is* the weighted
//! sort and only improvements replace the best, annealing can never do
//! worse than the sort.
//!
//! The RNG is seeded from the snapshot's content hash: identical snapshots
//! give identical rankings on every node, every run.
//!
//! ## Time budget
//!
//! If a round overruns `time_budget_ms`, the annealer gives up and the
//! weighted sort is returned with `degraded = true`. The schedule reports
//! that as a `SelectionTimeout` event.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::registry::{NodeId, RegistrySnapshot};
use crate::config::{ANNEALING_ITERATIONS, SELECTION_TIME_BUDGET};
use crate::crypto::Hash;

/// How often (in iterations) the annealer looks at the wall clock.
const BUDGET_CHECK_INTERVAL: u64 = 64;

/// Improvements smaller than this are treated as float noise.
const ENERGY_EPSILON: f64 = 1e-12;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("cannot rank an empty snapshot")]
    EmptySnapshot,
}

/// Weights and annealing schedule. All of it is configuration; none of it
/// is consensus-critical beyond "every node uses the same values".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub uptime_weight: f64,
    pub latency_weight: f64,
    pub throughput_weight: f64,
    pub reliability_weight: f64,
    /// λ: cost of placing near-identical scores in adjacent positions.
    pub diversity_weight: f64,
    /// Score distance at which two nodes stop counting as similar.
    pub similarity_threshold: f64,
    /// Latency is normalized as `l / (l + reference)`.
    pub latency_reference_seconds: f64,
    pub initial_temperature: f64,
    pub cooling_rate: f64,
    pub min_temperature: f64,
    pub iterations: u64,
    pub time_budget_ms: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            uptime_weight: 0.35,
            latency_weight: 0.25,
            throughput_weight: 0.20,
            reliability_weight: 0.20,
            diversity_weight: 0.10,
            similarity_threshold: 0.02,
            latency_reference_seconds: 0.1,
            initial_temperature: 0.5,
            cooling_rate: 0.999,
            min_temperature: 1e-4,
            iterations: ANNEALING_ITERATIONS,
            time_budget_ms: SELECTION_TIME_BUDGET.as_millis() as u64,
        }
    }
}

/// Composite scores for one selection round, keyed by node id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScoreSnapshot {
    scores: BTreeMap<NodeId, f64>,
}

impl ScoreSnapshot {
    pub fn get(&self, node_id: &str) -> Option<f64> {
        self.scores.get(node_id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &f64)> {
        self.scores.iter()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// Result of one selection round.
#[derive(Debug, Clone)]
pub struct Selection {
    /// Best node first.
    pub ranking: Vec<NodeId>,
    pub scores: ScoreSnapshot,
    /// `true` if the time budget was blown and this is the plain sort.
    pub degraded: bool,
    /// QUBO energy of `ranking`. Lower is better.
    pub energy: f64,
    pub iterations: u64,
    pub elapsed: Duration,
    /// The RNG seed (snapshot content hash).
    pub seed: Hash,
}

/// Stateless apart from its config; cheap to share.
#[derive(Debug, Clone, Default)]
pub struct LeaderSelector {
    config: SelectorConfig,
}

impl LeaderSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Composite score per node.
    ///
    /// Throughput is normalized against the snapshot's maximum (so a lone
    /// busy node doesn't need to know what "fast" means in absolute terms);
    /// latency is squashed into [0, 1) with the reference constant.
    pub fn score(&self, snapshot: &RegistrySnapshot) -> ScoreSnapshot {
        let c = &self.config;
        let max_throughput = snapshot
            .records()
            .iter()
            .map(|r| r.throughput)
            .fold(0.0_f64, f64::max);
        let latency_ref = c.latency_reference_seconds.max(f64::MIN_POSITIVE);

        let scores = snapshot
            .records()
            .iter()
            .map(|r| {
                let throughput = if max_throughput > 0.0 {
                    r.throughput / max_throughput
                } else {
                    0.0
                };
                let latency = r.latency_seconds / (r.latency_seconds + latency_ref);
                let score = c.uptime_weight * r.uptime + c.throughput_weight * throughput
                    - c.latency_weight * latency
                    - c.reliability_weight * r.failure_ratio();
                (r.node_id.clone(), score)
            })
            .collect();

        ScoreSnapshot { scores }
    }

    /// Rank the snapshot's nodes, best first.
    pub fn rank(&self, snapshot: &RegistrySnapshot) -> Result<Selection, SelectorError> {
        if snapshot.is_empty() {
            return Err(SelectorError::EmptySnapshot);
        }
        let started = Instant::now();
        let seed = snapshot.content_hash();
        let scores = self.score(snapshot);

        // Index space: position in the snapshot (node-id order).
        let ids: Vec<&NodeId> = snapshot.records().iter().map(|r| &r.node_id).collect();
        let values: Vec<f64> = ids
            .iter()
            .map(|id| scores.get(id.as_str()).unwrap_or(0.0))
            .collect();
        let model = QuboModel::new(
            values,
            self.config.diversity_weight,
            self.config.similarity_threshold,
        );

        let baseline = model.weighted_sort(&ids);
        let budget = Duration::from_millis(self.config.time_budget_ms);
        let outcome = anneal(&model, &baseline, &self.config, seed, started, budget);

        let (order, degraded, energy) = match outcome.best {
            Some(best) => (best, false, outcome.best_energy),
            None => {
                warn!(
                    budget_ms = self.config.time_budget_ms,
                    iterations = outcome.iterations,
                    "leader selection overran its budget, falling back to weighted sort"
                );
                let energy = model.energy(&baseline);
                (baseline, true, energy)
            }
        };

        let ranking: Vec<NodeId> = order.iter().map(|&i| ids[i].clone()).collect();
        let elapsed = started.elapsed();
        debug!(
            nodes = ranking.len(),
            iterations = outcome.iterations,
            energy,
            degraded,
            elapsed_ms = elapsed.as_millis() as u64,
            "leader selection complete"
        );

        Ok(Selection {
            ranking,
            scores,
            degraded,
            energy,
            iterations: outcome.iterations,
            elapsed,
            seed,
        })
    }

    /// Expand a ranking to exactly `slots` leaders by cyclic repetition.
    /// More candidates than slots simply truncates.
    pub fn assign_slots(ranking: &[NodeId], slots: u64) -> Vec<NodeId> {
        if ranking.is_empty() {
            return Vec::new();
        }
        ranking.iter().cycle().take(slots as usize).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// QUBO model
// ---------------------------------------------------------------------------

/// The objective, stored implicitly. A dense QUBO matrix over n² binary
/// variables would be n⁴ entries; the structure here makes every term
/// computable on demand.
struct QuboModel {
    scores: Vec<f64>,
    position_weights: Vec<f64>,
    diversity_weight: f64,
    similarity_threshold: f64,
}

impl QuboModel {
    fn new(scores: Vec<f64>, diversity_weight: f64, similarity_threshold: f64) -> Self {
        let n = scores.len();
        let position_weights = (0..n).map(|p| 1.0 - p as f64 / n as f64).collect();
        Self {
            scores,
            position_weights,
            diversity_weight,
            similarity_threshold,
        }
    }

    fn len(&self) -> usize {
        self.scores.len()
    }

    fn similarity(&self, i: usize, j: usize) -> f64 {
        if self.similarity_threshold <= 0.0 {
            return 0.0;
        }
        let distance = (self.scores[i] - self.scores[j]).abs();
        (1.0 - distance / self.similarity_threshold).max(0.0)
    }

    fn linear(&self, node: usize, position: usize) -> f64 {
        -self.scores[node] * self.position_weights[position]
    }

    fn pair(&self, order: &[usize], first: usize) -> f64 {
        self.diversity_weight * self.similarity(order[first], order[first + 1])
    }

    fn energy(&self, order: &[usize]) -> f64 {
        let linear: f64 = order
            .iter()
            .enumerate()
            .map(|(p, &node)| self.linear(node, p))
            .sum();
        let quadratic: f64 = (0..order.len().saturating_sub(1))
            .map(|p| self.pair(order, p))
            .sum();
        linear + quadratic
    }

    /// Energy of only the terms a swap of positions `a` and `b` touches.
    fn local_energy(&self, order: &[usize], a: usize, b: usize) -> f64 {
        let mut total = self.linear(order[a], a) + self.linear(order[b], b);
        let last_pair = order.len().saturating_sub(1);
        let mut starts = [a.wrapping_sub(1), a, b.wrapping_sub(1), b];
        starts.sort_unstable();
        let mut previous = usize::MAX;
        for &start in &starts {
            if start == previous || start >= last_pair {
                continue;
            }
            previous = start;
            total += self.pair(order, start);
        }
        total
    }

    /// Energy change if positions `a` and `b` were swapped.
    fn swap_delta(&self, order: &mut [usize], a: usize, b: usize) -> f64 {
        let before = self.local_energy(order, a, b);
        order.swap(a, b);
        let after = self.local_energy(order, a, b);
        order.swap(a, b);
        after - before
    }

    /// Score descending, node id ascending on ties.
    fn weighted_sort(&self, ids: &[&NodeId]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&i, &j| {
            self.scores[j]
                .total_cmp(&self.scores[i])
                .then_with(|| ids[i].cmp(ids[j]))
        });
        order
    }
}

struct AnnealOutcome {
    /// `None` when the time budget ran out.
    best: Option<Vec<usize>>,
    best_energy: f64,
    iterations: u64,
}

fn anneal(
    model: &QuboModel,
    start: &[usize],
    config: &SelectorConfig,
    seed: Hash,
    started: Instant,
    budget: Duration,
) -> AnnealOutcome {
    let n = model.len();
    let mut state = start.to_vec();
    let mut energy = model.energy(&state);
    let mut best = state.clone();
    let mut best_energy = energy;

    if n < 2 {
        return AnnealOutcome {
            best: Some(best),
            best_energy,
            iterations: 0,
        };
    }

    let mut rng = StdRng::from_seed(seed);
    let mut temperature = config.initial_temperature;

    for iteration in 0..config.iterations {
        if iteration % BUDGET_CHECK_INTERVAL == 0 && started.elapsed() >= budget {
            return AnnealOutcome {
                best: None,
                best_energy,
                iterations: iteration,
            };
        }

        let a = rng.gen_range(0..n);
        let mut b = rng.gen_range(0..n - 1);
        if b >= a {
            b += 1;
        }

        let delta = model.swap_delta(&mut state, a, b);
        let accept = delta <= 0.0 || rng.gen::<f64>() < (-delta / temperature).exp();
        if accept {
            state.swap(a, b);
            energy += delta;
            if energy < best_energy - ENERGY_EPSILON {
                // Recompute rather than trust the running sum.
                energy = model.energy(&state);
                best_energy = energy;
                best.clone_from(&state);
            }
        }

        temperature = (temperature * config.cooling_rate).max(config.min_temperature);
    }

    AnnealOutcome {
        best: Some(best),
        best_energy,
        iterations: config.iterations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::registry::{MetricsUpdate, NodeRegistry};
    use crate::crypto::NodeKeypair;

    fn scenario_registry() -> NodeRegistry {
        let registry = NodeRegistry::default();
        for (i, (id, uptime, latency)) in [
            ("node1", 1.0, 0.01),
            ("node2", 0.9, 0.05),
            ("node3", 0.5, 0.3),
        ]
        .into_iter()
        .enumerate()
        {
            registry.register(id, NodeKeypair::from_seed(&[i as u8 + 1; 32]).public_key());
            registry
                .update_metrics(
                    id,
                    MetricsUpdate {
                        uptime: Some(uptime),
                        latency_seconds: Some(latency),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        registry
    }

    fn big_registry(n: usize) -> NodeRegistry {
        let registry = NodeRegistry::default();
        for i in 0..n {
            let id = format!("node{:03}", i);
            let mut seed = [0u8; 32];
            seed[..8].copy_from_slice(&(i as u64).to_le_bytes());
            registry.register(id.clone(), NodeKeypair::from_seed(&seed).public_key());
            registry
                .update_metrics(
                    &id,
                    MetricsUpdate {
                        uptime: Some(((i * 37) % 100) as f64 / 100.0),
                        latency_seconds: Some(((i * 11) % 50) as f64 / 100.0),
                        throughput: Some(((i * 7) % 30) as f64),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        registry
    }

    #[test]
    fn three_node_scenario_ranks_by_quality() {
        let selector = LeaderSelector::default();
        let snapshot = scenario_registry().snapshot();
        for _ in 0..10 {
            let selection = selector.rank(&snapshot).unwrap();
            assert_eq!(selection.ranking, vec!["node1", "node2", "node3"]);
            assert!(!selection.degraded);
        }
    }

    #[test]
    fn identical_snapshots_give_identical_rankings() {
        let selector = LeaderSelector::default();
        let a = selector.rank(&big_registry(40).snapshot()).unwrap();
        let b = selector.rank(&big_registry(40).snapshot()).unwrap();
        assert_eq!(a.ranking, b.ranking);
        assert_eq!(a.energy.to_bits(), b.energy.to_bits());
        assert_eq!(a.seed, b.seed);
    }

    #[test]
    fn annealing_never_loses_to_the_weighted_sort() {
        let selector = LeaderSelector::default();
        let snapshot = big_registry(25).snapshot();
        let selection = selector.rank(&snapshot).unwrap();

        let ids: Vec<&NodeId> = snapshot.records().iter().map(|r| &r.node_id).collect();
        let values: Vec<f64> = ids
            .iter()
            .map(|id| selection.scores.get(id).unwrap())
            .collect();
        let model = QuboModel::new(values, 0.1, 0.02);
        let sorted = model.weighted_sort(&ids);
        assert!(selection.energy <= model.energy(&sorted) + 1e-9);
        assert_eq!(selection.ranking.len(), 25);
    }

    #[test]
    fn zero_budget_degrades_to_weighted_sort() {
        let selector = LeaderSelector::new(SelectorConfig {
            time_budget_ms: 0,
            ..SelectorConfig::default()
        });
        let selection = selector.rank(&scenario_registry().snapshot()).unwrap();
        assert!(selection.degraded);
        assert_eq!(selection.iterations, 0);
        assert_eq!(selection.ranking, vec!["node1", "node2", "node3"]);
    }

    #[test]
    fn empty_snapshot_is_an_error() {
        let selector = LeaderSelector::default();
        let empty = NodeRegistry::default().snapshot();
        assert_eq!(selector.rank(&empty).unwrap_err(), SelectorError::EmptySnapshot);
    }

    #[test]
    fn single_node_ranks_itself() {
        let registry = NodeRegistry::default();
        registry.register("solo", NodeKeypair::from_seed(&[1; 32]).public_key());
        let selection = LeaderSelector::default().rank(&registry.snapshot()).unwrap();
        assert_eq!(selection.ranking, vec!["solo"]);
    }

    #[test]
    fn failures_cost_rank() {
        let registry = NodeRegistry::default();
        registry.register("a", NodeKeypair::from_seed(&[1; 32]).public_key());
        registry.register("b", NodeKeypair::from_seed(&[2; 32]).public_key());
        for id in ["a", "b"] {
            registry
                .update_metrics(id, MetricsUpdate { uptime: Some(1.0), ..Default::default() })
                .unwrap();
        }
        registry.record_proposal("a", false).unwrap();
        registry.record_proposal("b", true).unwrap();

        let selection = LeaderSelector::default().rank(&registry.snapshot()).unwrap();
        assert_eq!(selection.ranking, vec!["b", "a"]);
    }

    #[test]
    fn diversity_term_separates_look_alikes() {
        // Two near-identical strong nodes and one clearly weaker one. With a
        // huge λ, keeping the twins adjacent costs more than demoting one.
        let model = QuboModel::new(vec![0.50, 0.501, 0.30], 10.0, 0.02);
        let adjacent = [1, 0, 2];
        let split = [1, 2, 0];
        assert!(model.energy(&split) < model.energy(&adjacent));
    }

    #[test]
    fn swap_delta_matches_full_recompute() {
        let model = QuboModel::new(vec![0.3, 0.31, 0.1, 0.5, 0.49, 0.2], 0.7, 0.05);
        let mut order = vec![0, 1, 2, 3, 4, 5];
        for (a, b) in [(0, 1), (0, 5), (2, 3), (4, 1), (5, 3)] {
            let before = model.energy(&order);
            let delta = model.swap_delta(&mut order, a, b);
            order.swap(a, b);
            let after = model.energy(&order);
            assert!((after - before - delta).abs() < 1e-12, "swap ({a},{b})");
        }
    }

    #[test]
    fn assign_slots_repeats_cyclically() {
        let ranking: Vec<NodeId> = vec!["x".into(), "y".into()];
        let slots = LeaderSelector::assign_slots(&ranking, 5);
        assert_eq!(slots, vec!["x", "y", "x", "y", "x"]);
        assert_eq!(LeaderSelector::assign_slots(&ranking, 1), vec!["x"]);
        assert!(LeaderSelector::assign_slots(&[], 5).is_empty());
    }
}
