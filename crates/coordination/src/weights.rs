//! Robust weight convergence.
//!
//! Each agent owns the weights of the shared loop closures it is responsible
//! for (lower id endpoint). A weight round recomputes those weights, measures
//! the largest change, and the root aggregates every active agent's report to
//! decide when the team has converged.

use crate::messages::SharedWeight;
use dpgo_core::{AgentId, EdgeKey, RelativeMeasurement};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Latched convergence detector over successive `max_delta` values
#[derive(Debug, Clone)]
pub struct WeightConvergence {
    threshold: f64,
    rounds: u64,
    converged: bool,
}

impl WeightConvergence {
    /// Detector for the given threshold
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            rounds: 0,
            converged: false,
        }
    }

    /// Feed one round's largest weight change; returns the convergence flag.
    ///
    /// Once converged, later rounds cannot clear the flag.
    pub fn record_round(&mut self, max_delta: f64) -> bool {
        self.rounds += 1;
        if !self.converged && max_delta < self.threshold {
            self.converged = true;
        }
        self.converged
    }

    /// Current flag
    pub fn is_converged(&self) -> bool {
        self.converged
    }

    /// Mark converged from an external report (a handoff carrying the flag)
    pub fn latch(&mut self) {
        self.converged = true;
    }

    /// Rounds recorded so far
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Convergence threshold
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Forget all rounds
    pub fn reset(&mut self) {
        self.rounds = 0;
        self.converged = false;
    }
}

/// Result of one local weight round
#[derive(Debug, Clone, PartialEq)]
pub struct LocalWeightRound {
    /// Round number (epoch of the UPDATE_WEIGHT command)
    pub round: u64,
    /// New weights of the responsible edges
    pub updates: Vec<SharedWeight>,
    /// Absolute change per responsible edge
    pub deltas: Vec<(EdgeKey, f64)>,
    /// Largest change, 0 when the agent owns no edges
    pub max_delta: f64,
}

/// Current weight of every shared loop closure an agent touches
#[derive(Debug, Default)]
pub struct WeightTable {
    weights: BTreeMap<EdgeKey, f64>,
}

impl WeightTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed weights from the measurements' initial values
    pub fn seed<'a>(&mut self, edges: impl IntoIterator<Item = &'a RelativeMeasurement>) {
        for edge in edges {
            self.weights.insert(edge.key(), edge.weight.clamp(0.0, 1.0));
        }
    }

    /// Current weight of `edge`
    pub fn get(&self, edge: &EdgeKey) -> Option<f64> {
        self.weights.get(edge).copied()
    }

    /// Apply a weight received from the responsible agent; returns true if it changed
    pub fn apply(&mut self, update: &SharedWeight) -> bool {
        let weight = update.weight.clamp(0.0, 1.0);
        let previous = self.weights.insert(update.edge, weight);
        previous.map(|w| w.to_bits() != weight.to_bits()).unwrap_or(true)
    }

    /// Recompute the weights of `responsible` edges with `statistic`.
    ///
    /// Edges the statistic cannot evaluate (missing pose estimates) keep their weight.
    pub fn recompute<'a, F>(
        &mut self,
        round: u64,
        responsible: impl IntoIterator<Item = &'a RelativeMeasurement>,
        mut statistic: F,
    ) -> LocalWeightRound
    where
        F: FnMut(&RelativeMeasurement) -> Option<f64>,
    {
        let mut updates = Vec::new();
        let mut deltas = Vec::new();
        for edge in responsible {
            let key = edge.key();
            let old = self.get(&key).unwrap_or_else(|| edge.weight.clamp(0.0, 1.0));
            let new = match statistic(edge) {
                Some(w) if w.is_finite() => w.clamp(0.0, 1.0),
                _ => {
                    debug!(r1 = key.r1, p1 = key.p1, r2 = key.r2, p2 = key.p2, "weight not evaluable");
                    old
                }
            };
            self.weights.insert(key, new);
            updates.push(SharedWeight { edge: key, weight: new });
            deltas.push((key, (new - old).abs()));
        }
        let max_delta = deltas.iter().map(|(_, d)| *d).fold(0.0, f64::max);
        LocalWeightRound {
            round,
            updates,
            deltas,
            max_delta,
        }
    }

    /// Number of tracked edges
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// True if no edges are tracked
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Drop every weight
    pub fn clear(&mut self) {
        self.weights.clear();
    }
}

/// Root-side aggregation of one team weight round
#[derive(Debug, Clone)]
pub struct TeamWeightRound {
    round: u64,
    reports: BTreeMap<AgentId, f64>,
}

impl TeamWeightRound {
    /// Start collecting reports for `round`
    pub fn new(round: u64) -> Self {
        Self {
            round,
            reports: BTreeMap::new(),
        }
    }

    /// Round being collected
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Record `agent`'s report; reports for other rounds are ignored
    pub fn record(&mut self, agent: AgentId, round: u64, max_delta: f64) -> bool {
        if round != self.round {
            return false;
        }
        self.reports.insert(agent, max_delta);
        true
    }

    /// Active agents that have not reported yet
    pub fn missing(&self, active: &BTreeSet<AgentId>) -> Vec<AgentId> {
        active
            .iter()
            .copied()
            .filter(|a| !self.reports.contains_key(a))
            .collect()
    }

    /// True once every active agent has reported; inactive agents do not block
    pub fn is_complete(&self, active: &BTreeSet<AgentId>) -> bool {
        self.missing(active).is_empty()
    }

    /// Largest change reported by an active agent
    pub fn max_delta(&self, active: &BTreeSet<AgentId>) -> f64 {
        self.reports
            .iter()
            .filter(|(a, _)| active.contains(a))
            .map(|(_, d)| *d)
            .fold(0.0, f64::max)
    }
}
