//! Synchronization barrier with bounded staleness.
//!
//! Before an UPDATE the executing agent needs, from every active neighbor `j`,
//! public poses at least as new as `iter_required[j]`. If a neighbor lags, the
//! update is deferred one scheduling round at a time; after
//! `max_delayed_iterations` deferred rounds it proceeds with the latest data it has.

use dpgo_core::AgentId;
use std::collections::{BTreeMap, BTreeSet};

/// Outcome of one barrier check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierDecision {
    /// Every active neighbor is fresh
    Ready,
    /// Some neighbors lag, but the staleness budget is exhausted
    ProceedStale {
        /// Neighbors whose data is older than required
        lagging: Vec<AgentId>,
    },
    /// Some neighbors lag; defer and re-check next round
    Wait {
        /// Neighbors whose data is older than required
        lagging: Vec<AgentId>,
        /// Consecutive deferred rounds so far, including this one
        deferred_rounds: u32,
    },
}

impl BarrierDecision {
    /// True if the update may run now
    pub fn may_proceed(&self) -> bool {
        !matches!(self, BarrierDecision::Wait { .. })
    }
}

/// Per-neighbor iteration counters
#[derive(Debug, Default)]
pub struct SyncBarrier {
    /// Freshest public-pose iteration received from each neighbor
    iter_received: BTreeMap<AgentId, u64>,
    /// Iteration each neighbor has announced it completed
    iter_required: BTreeMap<AgentId, u64>,
    /// Consecutive rounds the pending update has been deferred
    deferred_rounds: u32,
    /// Staleness budget
    max_delayed_iterations: u32,
}

impl SyncBarrier {
    /// Barrier with the given staleness budget
    pub fn new(max_delayed_iterations: u32) -> Self {
        Self {
            max_delayed_iterations,
            ..Self::default()
        }
    }

    /// Record fresh public poses from `neighbor` (counters never decrease)
    pub fn record_received(&mut self, neighbor: AgentId, iteration: u64) {
        let entry = self.iter_received.entry(neighbor).or_insert(0);
        *entry = (*entry).max(iteration);
    }

    /// Raise the iteration required from `neighbor` (counters never decrease)
    pub fn require(&mut self, neighbor: AgentId, iteration: u64) {
        let entry = self.iter_required.entry(neighbor).or_insert(0);
        *entry = (*entry).max(iteration);
    }

    /// Drop the outstanding requirement on `neighbor`; used when it leaves the active set.
    ///
    /// The requirement counts as met so both counters stay non-decreasing.
    pub fn release(&mut self, neighbor: AgentId) {
        let required = self.required(neighbor);
        self.record_received(neighbor, required);
    }

    /// Latest received iteration from `neighbor`
    pub fn received(&self, neighbor: AgentId) -> u64 {
        self.iter_received.get(&neighbor).copied().unwrap_or(0)
    }

    /// Latest required iteration from `neighbor`
    pub fn required(&self, neighbor: AgentId) -> u64 {
        self.iter_required.get(&neighbor).copied().unwrap_or(0)
    }

    /// Neighbors among `active_neighbors` whose data is older than required
    pub fn lagging<'a>(&self, active_neighbors: impl IntoIterator<Item = &'a AgentId>) -> Vec<AgentId> {
        active_neighbors
            .into_iter()
            .copied()
            .filter(|j| self.received(*j) < self.required(*j))
            .collect()
    }

    /// Run one scheduling round of the barrier for a pending update
    pub fn check(&mut self, active_neighbors: &BTreeSet<AgentId>) -> BarrierDecision {
        let lagging = self.lagging(active_neighbors);
        if lagging.is_empty() {
            self.deferred_rounds = 0;
            return BarrierDecision::Ready;
        }
        if self.deferred_rounds >= self.max_delayed_iterations {
            self.deferred_rounds = 0;
            return BarrierDecision::ProceedStale { lagging };
        }
        self.deferred_rounds += 1;
        BarrierDecision::Wait {
            lagging,
            deferred_rounds: self.deferred_rounds,
        }
    }

    /// Forget a pending update's deferral count
    pub fn clear_deferral(&mut self) {
        self.deferred_rounds = 0;
    }

    /// Consecutive deferred rounds of the pending update
    pub fn deferred_rounds(&self) -> u32 {
        self.deferred_rounds
    }

    /// Clear every counter
    pub fn reset(&mut self) {
        self.iter_received.clear();
        self.iter_required.clear();
        self.deferred_rounds = 0;
    }
}
