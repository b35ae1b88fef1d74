//! Next-agent selection.
//!
//! RoundRobin is a pure function of the active set and the last executor, so
//! any agent handing off computes the same successor. Uniform draws afresh
//! every round.

use dpgo_core::{AgentId, UpdateRule};
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::SeedableRng;
use std::collections::BTreeSet;
use std::ops::Bound;

/// Picks the agent that executes the next UPDATE
#[derive(Debug)]
pub struct Scheduler {
    rule: UpdateRule,
    rng: StdRng,
}

impl Scheduler {
    /// Scheduler seeded from OS entropy
    pub fn new(rule: UpdateRule) -> Self {
        Self {
            rule,
            rng: StdRng::from_entropy(),
        }
    }

    /// Scheduler with a fixed seed (reproducible Uniform draws)
    pub fn with_seed(rule: UpdateRule, seed: u64) -> Self {
        Self {
            rule,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Configured policy
    pub fn rule(&self) -> UpdateRule {
        self.rule
    }

    /// Choose the next executor; `None` only if the active set is empty
    pub fn select_next(&mut self, active: &BTreeSet<AgentId>, last_executed: AgentId) -> Option<AgentId> {
        match self.rule {
            UpdateRule::RoundRobin => round_robin_next(active, last_executed),
            UpdateRule::Uniform => {
                let others = active.iter().copied().filter(|a| *a != last_executed);
                others
                    .choose(&mut self.rng)
                    .or_else(|| active.contains(&last_executed).then_some(last_executed))
            }
        }
    }

    /// Choose the agent that opens a run
    pub fn select_first(&mut self, active: &BTreeSet<AgentId>) -> Option<AgentId> {
        match self.rule {
            UpdateRule::RoundRobin => active.iter().next().copied(),
            UpdateRule::Uniform => active.iter().copied().choose(&mut self.rng),
        }
    }
}

/// Smallest active id above `last_executed`, wrapping to the smallest active id
pub fn round_robin_next(active: &BTreeSet<AgentId>, last_executed: AgentId) -> Option<AgentId> {
    active
        .range((Bound::Excluded(last_executed), Bound::Unbounded))
        .next()
        .or_else(|| active.iter().next())
        .copied()
}
