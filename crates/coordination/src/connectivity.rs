//! Connectivity monitor
//!
//! Tracks when each peer was last heard from and derives the active set.
//! Every agent keeps its own local view for routing decisions, but once the
//! root has broadcast an ACTIVE_ROBOTS command that set is authoritative.

use crate::error::{CoordinationError, CoordinationResult};
use dpgo_core::AgentId;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Membership change produced by a recomputation of the active set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveSetChange {
    /// Agents that went from active to inactive
    pub lost: Vec<AgentId>,
    /// Agents that went from inactive to active
    pub recovered: Vec<AgentId>,
}

impl ActiveSetChange {
    /// True if membership did not change
    pub fn is_empty(&self) -> bool {
        self.lost.is_empty() && self.recovered.is_empty()
    }

    fn between(before: &BTreeSet<AgentId>, after: &BTreeSet<AgentId>) -> Self {
        Self {
            lost: before.difference(after).copied().collect(),
            recovered: after.difference(before).copied().collect(),
        }
    }
}

/// Last-seen table and active set for one agent
#[derive(Debug)]
pub struct ConnectivityMonitor {
    /// This agent
    self_id: AgentId,
    /// Every agent in the configured team
    team: BTreeSet<AgentId>,
    /// Silence tolerated before a peer is dropped
    timeout: Duration,
    /// Arrival time of each peer's latest heartbeat
    last_seen: BTreeMap<AgentId, Instant>,
    /// Locally derived view; always contains `self_id`
    local_view: BTreeSet<AgentId>,
    /// Root's broadcast view, once received
    authoritative: Option<BTreeSet<AgentId>>,
}

impl ConnectivityMonitor {
    /// Monitor for a team of `num_robots` agents with ids `0..num_robots`
    pub fn new(self_id: AgentId, num_robots: usize, timeout: Duration) -> Self {
        let team = (0..num_robots as AgentId).collect();
        Self {
            self_id,
            team,
            timeout,
            last_seen: BTreeMap::new(),
            local_view: BTreeSet::from([self_id]),
            authoritative: None,
        }
    }

    /// Record a heartbeat from `agent` at `now`.
    ///
    /// Returns true if the peer was not in the local view before. A peer that
    /// reappears is reinstated immediately.
    pub fn on_heartbeat(&mut self, agent: AgentId, now: Instant) -> CoordinationResult<bool> {
        if !self.team.contains(&agent) {
            return Err(CoordinationError::UnknownPeer(agent));
        }
        self.last_seen.insert(agent, now);
        let recovered = self.local_view.insert(agent);
        if recovered {
            debug!(agent = self.self_id, peer = agent, "peer reachable");
        }
        Ok(recovered)
    }

    /// Drop every peer silent for longer than the timeout and report what changed
    pub fn tick(&mut self, now: Instant) -> ActiveSetChange {
        let before = self.active_set();

        let timeout = self.timeout;
        let self_id = self.self_id;
        let last_seen = &self.last_seen;
        self.local_view.retain(|agent| {
            *agent == self_id
                || last_seen
                    .get(agent)
                    .map(|seen| now.saturating_duration_since(*seen) <= timeout)
                    .unwrap_or(false)
        });

        if self.authoritative.is_none() {
            let change = ActiveSetChange::between(&before, &self.local_view);
            for peer in &change.lost {
                info!(agent = self.self_id, peer, "peer timed out");
            }
            change
        } else {
            ActiveSetChange::default()
        }
    }

    /// Adopt the root's broadcast active set; this agent always stays in it
    pub fn adopt_authoritative(&mut self, robots: &[AgentId]) -> ActiveSetChange {
        let before = self.active_set();
        let mut adopted: BTreeSet<AgentId> = robots
            .iter()
            .copied()
            .filter(|r| self.team.contains(r))
            .collect();
        adopted.insert(self.self_id);
        let change = ActiveSetChange::between(&before, &adopted);
        if !change.is_empty() {
            info!(
                agent = self.self_id,
                lost = ?change.lost,
                recovered = ?change.recovered,
                "adopted root active set"
            );
        }
        self.authoritative = Some(adopted);
        change
    }

    /// Effective active set: the root's broadcast if present, else the local view
    pub fn active_set(&self) -> BTreeSet<AgentId> {
        self.authoritative
            .clone()
            .unwrap_or_else(|| self.local_view.clone())
    }

    /// Locally derived view, ignoring any broadcast
    pub fn local_view(&self) -> &BTreeSet<AgentId> {
        &self.local_view
    }

    /// True if `agent` is in the effective active set
    pub fn is_active(&self, agent: AgentId) -> bool {
        match &self.authoritative {
            Some(set) => set.contains(&agent),
            None => self.local_view.contains(&agent),
        }
    }

    /// Latest heartbeat arrival from `agent`
    pub fn last_seen(&self, agent: AgentId) -> Option<Instant> {
        self.last_seen.get(&agent).copied()
    }

    /// True if `agent` belongs to the configured team
    pub fn is_team_member(&self, agent: AgentId) -> bool {
        self.team.contains(&agent)
    }

    /// Forget all peers and any broadcast view
    pub fn reset(&mut self) {
        self.last_seen.clear();
        self.local_view = BTreeSet::from([self.self_id]);
        self.authoritative = None;
    }
}
