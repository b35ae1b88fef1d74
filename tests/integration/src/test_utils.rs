//! Test utilities for multi-agent integration tests
//!
//! `SyncTeam` drives a whole team on one thread with a manual clock: every
//! tick each online agent runs its periodic work, then outboxes are routed to
//! every other online agent until no agent has anything left to say.

use dpgo_coordination::{
    Agent, BusMessage, Command, CoordinationResult, IterationLog, IterationRecord, OptimizeResult,
    Optimizer,
};
use dpgo_core::{
    AgentConfig, AgentId, EdgeKey, Matrix, Pose, PoseGraphPartition, PoseIndex, RelativeMeasurement,
};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Translation norm above which the simulated robust cost rejects an edge
pub const OUTLIER_NORM: f64 = 10.0;

/// Routing passes per tick before the team is declared livelocked
const MAX_ROUTING_PASSES: usize = 256;

/// Install a test-friendly subscriber once; later calls are no-ops
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Simulated local optimizer.
///
/// Cost after `k` steps is `1 + 0.5^k`, so the relative change falls under
/// 1e-3 after ten steps. Edges longer than [`OUTLIER_NORM`] get weight 0.
#[derive(Debug, Default)]
pub struct SimOptimizer {
    pub steps: u32,
    pub lifting: Option<Matrix>,
    pub num_poses: usize,
    pub neighbor_updates: BTreeMap<AgentId, u64>,
    pub shared_weights: BTreeMap<EdgeKey, f64>,
    pub resets: u32,
}

impl Optimizer for SimOptimizer {
    fn optimize(&mut self) -> OptimizeResult {
        self.steps += 1;
        OptimizeResult {
            success: true,
            cost_before: 1.0 + 0.5f64.powi(self.steps as i32 - 1),
            cost_after: 1.0 + 0.5f64.powi(self.steps as i32),
        }
    }

    fn pose_estimate(&self, index: PoseIndex) -> Option<Pose> {
        let lifting = self.lifting.as_ref()?;
        if index as usize >= self.num_poses {
            return None;
        }
        let mut pose = Matrix::identity(lifting.rows(), lifting.cols() + 1);
        pose.set(0, lifting.cols(), f64::from(index) + f64::from(self.steps) * 1e-3);
        Some(pose)
    }

    fn set_lifting_matrix(&mut self, matrix: Matrix) {
        self.lifting = Some(matrix);
    }

    fn lifting_matrix(&self) -> Option<Matrix> {
        self.lifting.clone()
    }

    fn set_pose_graph(&mut self, partition: &PoseGraphPartition) {
        self.num_poses = partition.num_poses();
    }

    fn update_neighbor_pose(&mut self, owner: AgentId, _index: PoseIndex, _pose: Pose) {
        *self.neighbor_updates.entry(owner).or_default() += 1;
    }

    fn trajectory_in_global_frame(&self, anchor: &Pose) -> Option<Matrix> {
        if self.num_poses == 0 || anchor.cols() == 0 {
            return None;
        }
        let d = anchor.cols() - 1;
        Some(Matrix::zeros(d, (d + 1) * self.num_poses))
    }

    fn robust_weight(&self, edge: &RelativeMeasurement) -> Option<f64> {
        let norm = edge.translation.iter().map(|t| t * t).sum::<f64>().sqrt();
        Some(if norm > OUTLIER_NORM { 0.0 } else { 1.0 })
    }

    fn set_shared_weight(&mut self, edge: EdgeKey, weight: f64) {
        self.shared_weights.insert(edge, weight);
    }

    fn num_poses(&self) -> usize {
        self.num_poses
    }

    fn reset(&mut self) {
        *self = Self {
            resets: self.resets + 1,
            ..Self::default()
        };
    }
}

/// Relative measurement with identity rotation
pub fn measurement(r1: AgentId, p1: PoseIndex, r2: AgentId, p2: PoseIndex, translation: [f64; 3]) -> RelativeMeasurement {
    RelativeMeasurement {
        r1,
        p1,
        r2,
        p2,
        rotation: Matrix::identity(3, 3),
        translation: translation.to_vec(),
        kappa: 100.0,
        tau: 10.0,
        weight: 1.0,
    }
}

/// Per-robot edge lists of a chain of robots.
///
/// Each robot drives an odometry chain of `poses_per_robot` poses; robot `r`
/// and `r + 1` share one inlier loop closure, plus one gross outlier when
/// `with_outliers` is set.
pub fn chain_team_graph(num_robots: u32, poses_per_robot: u32, with_outliers: bool) -> Vec<Vec<RelativeMeasurement>> {
    let last = poses_per_robot - 1;
    let mut graphs: Vec<Vec<RelativeMeasurement>> = (0..num_robots)
        .map(|r| (0..last).map(|i| measurement(r, i, r, i + 1, [1.0, 0.0, 0.0])).collect())
        .collect();

    for r in 0..num_robots.saturating_sub(1) {
        let mut shared = vec![measurement(r, last, r + 1, 0, [1.0, 0.5, 0.0])];
        if with_outliers {
            shared.push(measurement(r, 0, r + 1, last, [100.0, -40.0, 0.0]));
        }
        for edge in shared {
            graphs[r as usize + 1].push(edge.clone());
            graphs[r as usize].push(edge);
        }
    }
    graphs
}

/// Keys of the outlier edges `chain_team_graph` adds
pub fn chain_outlier_edges(num_robots: u32, poses_per_robot: u32) -> Vec<EdgeKey> {
    (0..num_robots.saturating_sub(1))
        .map(|r| EdgeKey {
            r1: r,
            p1: 0,
            r2: r + 1,
            p2: poses_per_robot - 1,
        })
        .collect()
}

/// Keys of the inlier shared edges `chain_team_graph` adds
pub fn chain_inlier_edges(num_robots: u32, poses_per_robot: u32) -> Vec<EdgeKey> {
    (0..num_robots.saturating_sub(1))
        .map(|r| EdgeKey {
            r1: r,
            p1: poses_per_robot - 1,
            r2: r + 1,
            p2: 0,
        })
        .collect()
}

/// Configuration tuned for the manual clock: 100 ms ticks, short settle delay
pub fn team_config(num_robots: usize) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.optimizer.num_robots = num_robots;
    config.optimizer.max_iterations = 300;
    config.tick_interval = 0.1;
    config.root_settle_delay = 0.5;
    config
}

/// Decides whether `message` is lost on its way to `receiver`
pub type DropFilter = Box<dyn FnMut(&BusMessage, AgentId) -> bool>;

/// Alters `message` in flight, once for all receivers
pub type Rewrite = Box<dyn FnMut(&mut BusMessage)>;

/// Deterministic single-threaded team
pub struct SyncTeam {
    agents: Vec<Agent<SimOptimizer>>,
    now: Instant,
    tick: Duration,
    offline: BTreeSet<AgentId>,
    drop_filter: Option<DropFilter>,
    rewrite: Option<Rewrite>,
    duplicate: bool,
    commands: Vec<Command>,
    dropped: usize,
    errors: Vec<String>,
}

impl SyncTeam {
    /// One agent per edge list, agent `i` getting `graphs[i]`; non-root agents bootstrap at once
    pub fn new(config: AgentConfig, graphs: Vec<Vec<RelativeMeasurement>>) -> Self {
        let tick = config.tick();
        let agents = graphs
            .into_iter()
            .enumerate()
            .map(|(id, edges)| {
                let mut agent = Agent::new(id as AgentId, config.clone(), SimOptimizer::default())
                    .expect("agent config is valid")
                    .with_scheduler_seed(id as u64 + 1)
                    .with_iteration_log(IterationLog::open_in_memory().expect("in-memory log"));
                agent.stage_pose_graph(edges);
                agent
            })
            .collect();
        let mut team = Self {
            agents,
            now: Instant::now(),
            tick,
            offline: BTreeSet::new(),
            drop_filter: None,
            rewrite: None,
            duplicate: false,
            commands: Vec::new(),
            dropped: 0,
            errors: Vec::new(),
        };
        team.bootstrap_pending();
        team
    }

    /// Deliver every message twice
    pub fn set_duplicate(&mut self, duplicate: bool) {
        self.duplicate = duplicate;
    }

    /// Lose messages chosen by `filter`
    pub fn set_drop_filter(&mut self, filter: impl FnMut(&BusMessage, AgentId) -> bool + 'static) {
        self.drop_filter = Some(Box::new(filter));
    }

    /// Alter messages in flight with `rewrite`
    pub fn set_rewrite(&mut self, rewrite: impl FnMut(&mut BusMessage) + 'static) {
        self.rewrite = Some(Box::new(rewrite));
    }

    /// Silence `agent`: it neither ticks, publishes nor receives
    pub fn set_offline(&mut self, agent: AgentId) {
        self.offline.insert(agent);
    }

    pub fn agent(&self, id: AgentId) -> &Agent<SimOptimizer> {
        &self.agents[id as usize]
    }

    pub fn agent_mut(&mut self, id: AgentId) -> &mut Agent<SimOptimizer> {
        &mut self.agents[id as usize]
    }

    pub fn agents(&self) -> &[Agent<SimOptimizer>] {
        &self.agents
    }

    /// Every command routed so far, in publication order
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Deliveries suppressed by the drop filter
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Recoverable handler errors seen so far
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Advance the clock by one tick and let the team react
    pub fn tick(&mut self) {
        self.now += self.tick;
        self.bootstrap_pending();
        for id in 0..self.agents.len() {
            if self.offline.contains(&(id as AgentId)) {
                continue;
            }
            let result = self.agents[id].tick(self.now);
            self.settle(id as AgentId, result);
            self.route();
        }
    }

    /// Tick until `done` holds; false if `max_ticks` ran out first
    pub fn run_until(&mut self, max_ticks: usize, done: impl Fn(&SyncTeam) -> bool) -> bool {
        for _ in 0..max_ticks {
            if done(self) {
                return true;
            }
            self.tick();
        }
        done(self)
    }

    /// True once every online agent has terminated
    pub fn all_terminated(&self) -> bool {
        self.agents
            .iter()
            .filter(|a| !self.offline.contains(&a.id()))
            .all(|a| a.is_terminal())
    }

    /// Every logged update of the team, ordered by epoch
    pub fn iterations(&self) -> Vec<IterationRecord> {
        let mut records: Vec<IterationRecord> = self
            .agents
            .iter()
            .filter_map(|a| a.iteration_log())
            .flat_map(|log| log.iterations().expect("iteration log readable"))
            .collect();
        records.sort_by_key(|r| r.epoch);
        records
    }

    /// Executor of each logged update, in epoch order
    pub fn executors(&self) -> Vec<AgentId> {
        self.iterations().iter().map(|r| r.agent_id).collect()
    }

    fn bootstrap_pending(&mut self) {
        if self.offline.contains(&0) {
            return;
        }
        for id in 1..self.agents.len() {
            if self.offline.contains(&(id as AgentId)) || !self.agents[id].needs_bootstrap() {
                continue;
            }
            let request = self.agents[id].lifting_request();
            let response = self.agents[0]
                .answer_lifting_query(&request)
                .expect("root answers bootstrap queries");
            self.agents[id]
                .accept_lifting_matrix(response)
                .expect("root's lifting matrix is consistent");
        }
    }

    fn route(&mut self) {
        for _ in 0..MAX_ROUTING_PASSES {
            let mut batch = Vec::new();
            for agent in self.agents.iter_mut() {
                let outbox = agent.drain_outbox();
                if !self.offline.contains(&agent.id()) {
                    batch.extend(outbox);
                }
            }
            if batch.is_empty() {
                return;
            }

            for mut msg in batch {
                if let Some(rewrite) = self.rewrite.as_mut() {
                    rewrite(&mut msg);
                }
                if let BusMessage::Command(command) = &msg {
                    self.commands.push(command.clone());
                }
                for receiver in 0..self.agents.len() {
                    let rid = receiver as AgentId;
                    if rid == msg.publisher() || self.offline.contains(&rid) {
                        continue;
                    }
                    if let Some(filter) = self.drop_filter.as_mut() {
                        if filter(&msg, rid) {
                            self.dropped += 1;
                            continue;
                        }
                    }
                    let copies = if self.duplicate { 2 } else { 1 };
                    for _ in 0..copies {
                        let result = self.agents[receiver].handle_message(msg.clone(), self.now);
                        self.settle(rid, result);
                    }
                }
            }
        }
        panic!("message routing did not settle within {MAX_ROUTING_PASSES} passes");
    }

    fn settle(&mut self, agent: AgentId, result: CoordinationResult<()>) {
        if let Err(e) = result {
            assert!(!e.is_fatal(), "agent {agent} hit a fatal error: {e}");
            tracing::debug!(agent, error = %e, "recoverable handler error");
            self.errors.push(format!("agent {agent}: {e}"));
        }
    }
}

/// Steps executed by `agent` according to its log
pub fn logged_steps(team: &SyncTeam, agent: AgentId) -> Vec<IterationRecord> {
    team.iterations().into_iter().filter(|r| r.agent_id == agent).collect()
}

/// Serialize a command the way it would cross a real transport
pub fn command_json(command: &Command) -> serde_json::Value {
    serde_json::to_value(command).expect("commands serialize")
}
