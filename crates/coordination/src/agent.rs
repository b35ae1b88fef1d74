//! Command dispatcher and agent state machine.
//!
//! One `Agent` per robot. Inbound bus messages and periodic ticks are fed in
//! by the runtime; every handler runs to completion and leaves outbound
//! messages in an outbox the runtime publishes afterwards. Commands the agent
//! publishes itself are processed locally at once, so the bus echo is ignored.
//!
//! The update token moves Gauss-Seidel style: the agent that executed an
//! UPDATE hands off by publishing the next one. The root issues the first
//! UPDATE of a run, recovery UPDATEs, and the UPDATE that closes a weight round.

use crate::barrier::{BarrierDecision, SyncBarrier};
use crate::bootstrap::{canonical_lifting_matrix, BootstrapCoordinator, LiftingSync};
use crate::connectivity::{ActiveSetChange, ConnectivityMonitor};
use crate::error::{CoordinationError, CoordinationResult};
use crate::iteration_log::{now_ms, IterationLog, IterationRecord, WeightRoundRecord};
use crate::messages::{
    AgentState, Anchor, BusMessage, Command, CommandKind, LiftingMatrixMsg, LiftingMatrixRequest,
    LiftingMatrixResponse, MeasurementWeights, PublicMeasurements, PublicPose, PublicPoses, Status,
};
use crate::optimizer::Optimizer;
use crate::scheduler::Scheduler;
use crate::weights::{TeamWeightRound, WeightConvergence, WeightTable};
use dpgo_core::{AgentConfig, AgentId, Matrix, PoseGraphPartition, RelativeMeasurement, ROOT_AGENT};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Coordination state of one agent
pub struct Agent<O: Optimizer> {
    id: AgentId,
    config: AgentConfig,
    state: AgentState,
    optimizer: O,
    connectivity: ConnectivityMonitor,
    barrier: SyncBarrier,
    scheduler: Scheduler,
    bootstrap: BootstrapCoordinator,
    weights: WeightTable,
    convergence: WeightConvergence,
    /// Root only: weight round being collected
    team_round: Option<TeamWeightRound>,
    log: Option<IterationLog>,

    staged_edges: Option<Vec<RelativeMeasurement>>,
    partition: Option<PoseGraphPartition>,

    /// Local update count
    iteration: u64,
    /// Largest step epoch seen
    epoch: u64,
    last_step_seen: Option<Instant>,
    last_executor: Option<AgentId>,
    /// UPDATE held back by the barrier
    pending_update: Option<Command>,
    /// Next command and the time it may be published
    pending_handoff: Option<(Command, Instant)>,
    ready_to_terminate: bool,
    last_weight_report: Option<(u64, f64)>,
    peer_status: BTreeMap<AgentId, Status>,
    /// Peers whose shared loop closures have arrived
    shared_closures_from: BTreeSet<AgentId>,
    /// Root only: epoch at which a lost token holder was last replaced
    reelected_at_epoch: Option<u64>,
    bytes_received: u64,

    loaded_at: Option<Instant>,
    last_graph_request: Option<Instant>,
    last_active_broadcast: Option<Vec<AgentId>>,
    trajectory: Option<Matrix>,
    outbox: Vec<BusMessage>,
}

impl<O: Optimizer> std::fmt::Debug for Agent<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("iteration", &self.iteration)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl<O: Optimizer> Agent<O> {
    /// Create agent `id`. Opens the iteration log if a log directory is configured.
    pub fn new(id: AgentId, config: AgentConfig, optimizer: O) -> CoordinationResult<Self> {
        config.validate()?;
        if id as usize >= config.optimizer.num_robots {
            return Err(CoordinationError::UnknownPeer(id));
        }
        let opt = &config.optimizer;
        let log = match config.log_path(id) {
            Some(path) => match IterationLog::open(&path) {
                Ok(log) => Some(log),
                Err(e) => {
                    warn!(agent = id, path = %path.display(), error = %e, "iteration log unavailable");
                    None
                }
            },
            None => None,
        };

        let mut agent = Self {
            id,
            state: AgentState::Idle,
            connectivity: ConnectivityMonitor::new(id, opt.num_robots, config.timeout()),
            barrier: SyncBarrier::new(config.max_delayed_iterations),
            scheduler: Scheduler::new(config.update_rule),
            bootstrap: BootstrapCoordinator::new(
                id,
                opt.relaxation_rank,
                opt.dimension,
                config.max_distributed_init_steps,
            ),
            weights: WeightTable::new(),
            convergence: WeightConvergence::new(config.weight_convergence_threshold),
            team_round: None,
            log,
            staged_edges: None,
            partition: None,
            iteration: 0,
            epoch: 0,
            last_step_seen: None,
            last_executor: None,
            pending_update: None,
            pending_handoff: None,
            ready_to_terminate: false,
            last_weight_report: None,
            peer_status: BTreeMap::new(),
            shared_closures_from: BTreeSet::new(),
            reelected_at_epoch: None,
            bytes_received: 0,
            loaded_at: None,
            last_graph_request: None,
            last_active_broadcast: None,
            trajectory: None,
            outbox: Vec::new(),
            optimizer,
            config,
        };
        if agent.is_root() {
            agent.install_root_lifting()?;
        }
        info!(agent = id, rule = ?agent.config.update_rule, "agent created");
        Ok(agent)
    }

    /// Replace the scheduler with a seeded one
    pub fn with_scheduler_seed(mut self, seed: u64) -> Self {
        self.scheduler = Scheduler::with_seed(self.config.update_rule, seed);
        self
    }

    /// Attach an iteration log
    pub fn with_iteration_log(mut self, log: IterationLog) -> Self {
        self.log = Some(log);
        self
    }

    // ---- accessors ----

    /// This agent's id
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// True on agent 0
    pub fn is_root(&self) -> bool {
        self.id == ROOT_AGENT
    }

    /// Protocol state
    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Local update count
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Largest step epoch seen
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Effective active set
    pub fn active_set(&self) -> BTreeSet<AgentId> {
        self.connectivity.active_set()
    }

    /// Connectivity monitor
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Synchronization barrier
    pub fn barrier(&self) -> &SyncBarrier {
        &self.barrier
    }

    /// Local optimizer
    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    /// Loaded partition
    pub fn partition(&self) -> Option<&PoseGraphPartition> {
        self.partition.as_ref()
    }

    /// Held lifting matrix
    pub fn lifting_matrix(&self) -> Option<&Matrix> {
        self.bootstrap.lifting_matrix()
    }

    /// Latest global anchor
    pub fn anchor(&self) -> Option<&Anchor> {
        self.bootstrap.anchor()
    }

    /// Latest global-frame trajectory
    pub fn trajectory(&self) -> Option<&Matrix> {
        self.trajectory.as_ref()
    }

    /// Current weight table
    pub fn weights(&self) -> &WeightTable {
        &self.weights
    }

    /// Team weights converged (latched)
    pub fn weights_converged(&self) -> bool {
        self.convergence.is_converged()
    }

    /// UPDATE waiting on the barrier
    pub fn pending_update(&self) -> Option<&Command> {
        self.pending_update.as_ref()
    }

    /// Payload bytes received from peers
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Shared loop closures of every active neighbor have arrived
    pub fn shared_closures_ready(&self) -> bool {
        self.partition.is_some()
            && self
                .active_neighbors()
                .iter()
                .all(|n| self.shared_closures_from.contains(n))
    }

    /// Iteration log
    pub fn iteration_log(&self) -> Option<&IterationLog> {
        self.log.as_ref()
    }

    /// Terminated with no way back to IDLE
    pub fn is_terminal(&self) -> bool {
        self.state == AgentState::Terminated && !self.config.complete_reset
    }

    /// Non-root agent without a lifting matrix
    pub fn needs_bootstrap(&self) -> bool {
        !self.is_root() && self.bootstrap.lifting_matrix().is_none()
    }

    /// Take everything queued for publication
    pub fn drain_outbox(&mut self) -> Vec<BusMessage> {
        std::mem::take(&mut self.outbox)
    }

    // ---- bootstrap surface ----

    /// Query this agent sends the root at startup
    pub fn lifting_request(&self) -> LiftingMatrixRequest {
        self.bootstrap.request()
    }

    /// Root side of the bootstrap query
    pub fn answer_lifting_query(&self, request: &LiftingMatrixRequest) -> CoordinationResult<LiftingMatrixResponse> {
        self.bootstrap.answer(request)
    }

    /// Verify and install the root's answer
    pub fn accept_lifting_matrix(&mut self, response: LiftingMatrixResponse) -> CoordinationResult<()> {
        let matrix = self.bootstrap.accept_response(response)?.clone();
        self.optimizer.set_lifting_matrix(matrix);
        Ok(())
    }

    fn install_root_lifting(&mut self) -> CoordinationResult<()> {
        let opt = &self.config.optimizer;
        let matrix = self
            .optimizer
            .lifting_matrix()
            .unwrap_or_else(|| canonical_lifting_matrix(opt.relaxation_rank, opt.dimension));
        self.bootstrap.install_canonical(matrix.clone())?;
        self.optimizer.set_lifting_matrix(matrix);
        Ok(())
    }

    /// Hand over the raw edges of this agent's partition; loaded when the run starts
    pub fn stage_pose_graph(&mut self, edges: Vec<RelativeMeasurement>) {
        debug!(agent = self.id, edges = edges.len(), "pose graph staged");
        self.staged_edges = Some(edges);
    }

    // ---- state machine ----

    fn transition(&mut self, to: AgentState) -> CoordinationResult<()> {
        use AgentState::*;
        let from = self.state;
        let allowed = from == to
            || to == Terminated
            || matches!(
                (from, to),
                (Idle, PoseGraphLoaded)
                    | (PoseGraphLoaded, Initializing)
                    | (Initializing, Optimizing)
                    | (Optimizing, WeightUpdating)
                    | (WeightUpdating, Optimizing)
            )
            || (from == Terminated && to == Idle && self.config.complete_reset);
        if !allowed {
            return Err(CoordinationError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        if from != to {
            info!(agent = self.id, %from, %to, "state transition");
        }
        self.state = to;
        Ok(())
    }

    fn load_pose_graph(&mut self, now: Instant) -> CoordinationResult<()> {
        let lifting = self
            .bootstrap
            .lifting_matrix()
            .cloned()
            .ok_or(CoordinationError::LiftingMatrixUnavailable(self.id))?;
        let edges = self.staged_edges.clone().ok_or(CoordinationError::PoseGraphMissing)?;
        self.transition(AgentState::PoseGraphLoaded)?;

        let (partition, rejected) = PoseGraphPartition::from_edges(self.id, edges);
        if !rejected.is_empty() {
            let err = CoordinationError::MalformedMeasurement {
                agent: self.id,
                reason: format!("{} edges do not reference this agent", rejected.len()),
            };
            warn!(agent = self.id, error = %err, "measurements discarded");
        }
        self.optimizer.set_lifting_matrix(lifting);
        self.optimizer.set_pose_graph(&partition);
        self.weights.clear();
        self.weights.seed(&partition.shared_loop_closures);
        info!(
            agent = self.id,
            poses = partition.num_poses(),
            edges = partition.edge_count(),
            neighbors = ?partition.neighbors(),
            "pose graph loaded"
        );
        self.partition = Some(partition);
        self.loaded_at = Some(now);
        self.publish_shared_closures();
        Ok(())
    }

    /// Return to IDLE, forgetting everything but the staged graph and the last trajectory
    pub fn reset(&mut self) -> CoordinationResult<()> {
        if !self.config.complete_reset {
            return Err(CoordinationError::InvalidStateTransition {
                from: self.state.to_string(),
                to: AgentState::Idle.to_string(),
            });
        }
        self.connectivity.reset();
        self.barrier.reset();
        self.weights.clear();
        self.convergence.reset();
        self.team_round = None;
        self.bootstrap.reset();
        self.optimizer.reset();
        self.partition = None;
        self.iteration = 0;
        self.epoch = 0;
        self.last_step_seen = None;
        self.last_executor = None;
        self.pending_update = None;
        self.pending_handoff = None;
        self.ready_to_terminate = false;
        self.last_weight_report = None;
        self.peer_status.clear();
        self.shared_closures_from.clear();
        self.reelected_at_epoch = None;
        self.loaded_at = None;
        self.last_graph_request = None;
        self.last_active_broadcast = None;
        self.state = AgentState::Idle;
        if self.is_root() {
            self.install_root_lifting()?;
        }
        info!(agent = self.id, "agent reset");
        Ok(())
    }

    // ---- outbound ----

    fn status(&self) -> Status {
        let threshold = self.config.weight_convergence_threshold;
        Status {
            agent_id: self.id,
            state: self.state,
            iteration: self.iteration,
            epoch: self.epoch,
            connected_peers: self
                .connectivity
                .local_view()
                .iter()
                .copied()
                .filter(|a| *a != self.id)
                .collect(),
            ready_to_terminate: self.ready_to_terminate,
            weight_round: self.last_weight_report.map(|(round, _)| round),
            weight_max_delta: self.last_weight_report.map(|(_, delta)| delta),
            weights_converged: self
                .last_weight_report
                .map(|(_, delta)| delta < threshold)
                .unwrap_or(false),
            lifting_digest: self.bootstrap.lifting_digest().map(str::to_owned),
            shared_closures_ready: self.shared_closures_ready(),
        }
    }

    fn emit_status(&mut self) {
        let status = self.status();
        self.outbox.push(BusMessage::Status(status));
    }

    /// Publish a command and process it locally
    fn publish_command(&mut self, command: Command, now: Instant) -> CoordinationResult<()> {
        debug!(
            agent = self.id,
            kind = ?command.kind,
            executing = command.executing_agent,
            epoch = command.epoch,
            "publishing command"
        );
        self.outbox.push(BusMessage::Command(command.clone()));
        self.handle_command(command, now)
    }

    fn publish_shared_closures(&mut self) {
        let Some(partition) = self.partition.as_ref() else {
            return;
        };
        debug!(agent = self.id, edges = partition.shared_loop_closures.len(), "publishing shared loop closures");
        self.outbox.push(BusMessage::PublicMeasurements(PublicMeasurements {
            publisher: self.id,
            measurements: partition.shared_loop_closures.clone(),
        }));
    }

    /// Some active neighbor has not yet confirmed it holds every shared closure.
    /// A neighbor never heard from counts only until this agent is running.
    fn closures_unconfirmed(&self) -> bool {
        let running = self.state.is_running();
        self.active_neighbors().iter().any(|n| {
            self.peer_status
                .get(n)
                .map(|s| !s.shared_closures_ready)
                .unwrap_or(!running)
        })
    }

    fn active_neighbors(&self) -> BTreeSet<AgentId> {
        let active = self.connectivity.active_set();
        self.partition
            .as_ref()
            .map(|p| p.neighbors().intersection(&active).copied().collect())
            .unwrap_or_default()
    }

    // ---- inbound ----

    /// Process one bus message. Own echoes are ignored.
    pub fn handle_message(&mut self, msg: BusMessage, now: Instant) -> CoordinationResult<()> {
        let publisher = msg.publisher();
        if publisher == self.id {
            return Ok(());
        }
        if !self.connectivity.is_team_member(publisher) {
            return Err(CoordinationError::UnknownPeer(publisher));
        }
        self.bytes_received = self.bytes_received.saturating_add(msg.payload_bytes() as u64);
        match msg {
            BusMessage::Command(command) => self.handle_command(command, now),
            BusMessage::Status(status) => self.handle_status(status, now),
            BusMessage::PublicPoses(poses) => self.handle_public_poses(poses),
            BusMessage::PublicMeasurements(measurements) => self.handle_public_measurements(measurements),
            BusMessage::Weights(weights) => self.handle_weights(weights),
            BusMessage::LiftingMatrix(lifting) => self.handle_lifting_matrix(&lifting),
            BusMessage::Anchor(anchor) => {
                if self.bootstrap.on_anchor(anchor) && self.config.publish_iterate && self.state.is_running() {
                    self.refresh_trajectory()?;
                }
                Ok(())
            }
        }
    }

    fn handle_command(&mut self, command: Command, now: Instant) -> CoordinationResult<()> {
        match command.kind {
            CommandKind::Unknown => {
                warn!(agent = self.id, publisher = command.publishing_agent, "unrecognized command dropped");
                return Ok(());
            }
            CommandKind::Noop => {
                debug!(agent = self.id, publisher = command.publishing_agent, "noop");
                return Ok(());
            }
            _ => {}
        }

        if command.kind.is_step() {
            if !self.connectivity.is_team_member(command.executing_agent) {
                warn!(agent = self.id, executing = command.executing_agent, "step command addressed to no team member");
                return Ok(());
            }
            if command.epoch <= self.epoch {
                debug!(agent = self.id, epoch = command.epoch, seen = self.epoch, "stale step command dropped");
                return Ok(());
            }
            self.epoch = command.epoch;
            self.last_step_seen = Some(now);
            self.last_executor = Some(match command.kind {
                CommandKind::Update => command.executing_agent,
                _ => command.publishing_agent,
            });
            if command.publishing_agent != self.id {
                self.barrier.require(command.publishing_agent, command.publisher_iteration);
                // A newer token supersedes anything held locally
                self.pending_update = None;
                self.pending_handoff = None;
            }
            if command.weights_converged && !self.convergence.is_converged() {
                info!(agent = self.id, "team weights converged");
                self.convergence.latch();
            }
        }

        match command.kind {
            CommandKind::RequestPoseGraph => self.on_request_pose_graph(now),
            CommandKind::Initialize => self.on_initialize(&command),
            CommandKind::Update => self.on_update(command, now),
            CommandKind::UpdateWeight => self.on_update_weight(&command),
            CommandKind::Terminate => self.terminate(true),
            CommandKind::HardTerminate => self.terminate(false),
            CommandKind::ActiveRobots => {
                if !self.is_root() && command.publishing_agent == ROOT_AGENT {
                    let change = self.connectivity.adopt_authoritative(&command.active_robots);
                    self.release_lost(&change);
                }
                Ok(())
            }
            CommandKind::Noop | CommandKind::Unknown => Ok(()),
        }
    }

    fn on_request_pose_graph(&mut self, now: Instant) -> CoordinationResult<()> {
        if self.is_root() {
            return Ok(());
        }
        if self.state == AgentState::Idle {
            self.load_pose_graph(now)?;
        }
        if self.state == AgentState::PoseGraphLoaded {
            self.transition(AgentState::Initializing)?;
            self.bootstrap.reset_init();
            self.emit_status();
        }
        Ok(())
    }

    fn on_initialize(&mut self, command: &Command) -> CoordinationResult<()> {
        if !command.addresses(self.id) {
            return Ok(());
        }
        match self.state {
            AgentState::PoseGraphLoaded => {
                self.transition(AgentState::Initializing)?;
                self.bootstrap.reset_init();
            }
            AgentState::Initializing => {
                self.transition(AgentState::Optimizing)?;
                info!(agent = self.id, attempts = self.bootstrap.init_attempts(), "initialization acknowledged");
            }
            other => {
                debug!(agent = self.id, state = %other, "INITIALIZE ignored");
                return Ok(());
            }
        }
        self.emit_status();
        Ok(())
    }

    fn on_update(&mut self, command: Command, now: Instant) -> CoordinationResult<()> {
        if self.state == AgentState::WeightUpdating {
            self.transition(AgentState::Optimizing)?;
        }
        if !command.addresses(self.id) {
            return Ok(());
        }
        if !self.state.is_running() {
            if self.state != AgentState::Terminated {
                self.pass_on(&command, now);
            }
            return Ok(());
        }
        self.barrier.clear_deferral();
        self.pending_update = Some(command);
        self.try_pending_update(now)
    }

    /// Forward an UPDATE this agent cannot execute
    fn pass_on(&mut self, command: &Command, now: Instant) {
        let active = self.connectivity.active_set();
        match self.scheduler.select_next(&active, self.id) {
            Some(next) if next != self.id => {
                debug!(agent = self.id, state = %self.state, next, "passing UPDATE on");
                let handoff = Command::new(CommandKind::Update, self.id, next, command.epoch.saturating_add(1))
                    .with_iteration(self.iteration)
                    .with_weights_converged(self.convergence.is_converged());
                self.pending_handoff = Some((handoff, now));
            }
            _ => debug!(agent = self.id, "no agent to pass UPDATE to"),
        }
    }

    fn try_pending_update(&mut self, now: Instant) -> CoordinationResult<()> {
        let Some(command) = self.pending_update.take() else {
            return Ok(());
        };
        let neighbors = self.active_neighbors();
        match self.barrier.check(&neighbors) {
            BarrierDecision::Ready => self.execute_update(command, false, now),
            BarrierDecision::ProceedStale { lagging } => {
                warn!(agent = self.id, ?lagging, "staleness budget exhausted, updating with stale neighbor data");
                self.execute_update(command, true, now)
            }
            BarrierDecision::Wait { lagging, deferred_rounds } => {
                debug!(agent = self.id, ?lagging, deferred_rounds, "update deferred");
                self.pending_update = Some(command);
                Ok(())
            }
        }
    }

    fn execute_update(&mut self, command: Command, stale: bool, now: Instant) -> CoordinationResult<()> {
        let started = Instant::now();
        let result = self.optimizer.optimize();
        let elapsed = started.elapsed();
        self.iteration += 1;
        if !result.success {
            warn!(agent = self.id, iteration = self.iteration, "local optimization step failed");
        }
        let weights_settled = !self.config.optimizer.robust_weighting || self.convergence.is_converged();
        self.ready_to_terminate = result.success
            && weights_settled
            && result.relative_change() < self.config.optimizer.relative_change_tolerance;
        debug!(
            agent = self.id,
            iteration = self.iteration,
            epoch = command.epoch,
            cost_before = result.cost_before,
            cost_after = result.cost_after,
            stale,
            "update executed"
        );

        self.publish_public_poses();
        self.emit_status();

        if let Some(log) = self.log.as_mut() {
            let record = IterationRecord {
                agent_id: self.id,
                timestamp_ms: now_ms(),
                iteration: self.iteration,
                epoch: command.epoch,
                cost_before: result.cost_before,
                cost_after: result.cost_after,
                elapsed_ms: elapsed.as_millis() as u64,
                stale,
                bytes_received: self.bytes_received,
            };
            if let Err(e) = log.append_iteration(&record) {
                warn!(agent = self.id, error = %e, "iteration log append failed");
            }
        }

        if self.is_root() {
            self.broadcast_anchor();
        }
        if self.config.publish_iterate {
            if let Err(e) = self.refresh_trajectory() {
                debug!(agent = self.id, error = %e, "global trajectory not refreshed");
            }
        }

        let next_epoch = command.epoch.saturating_add(1);
        let inner = self.config.optimizer.robust_opt_inner_iters.max(1);
        let converged = self.convergence.is_converged();
        let base = if self.config.optimizer.robust_weighting && !converged && next_epoch % inner == 0 {
            Command::new(CommandKind::UpdateWeight, self.id, self.id, next_epoch)
        } else {
            let active = self.connectivity.active_set();
            let next = self.scheduler.select_next(&active, self.id).unwrap_or(self.id);
            Command::new(CommandKind::Update, self.id, next, next_epoch)
        };
        let handoff = base
            .with_iteration(self.iteration)
            .with_weights_converged(converged);
        self.pending_handoff = Some((handoff, now + self.config.inter_update_sleep()));
        Ok(())
    }

    fn publish_public_poses(&mut self) {
        let indices = self
            .partition
            .as_ref()
            .map(|p| p.public_pose_indices())
            .unwrap_or_default();
        let mut poses = Vec::with_capacity(indices.len());
        for index in indices {
            match self.optimizer.pose_estimate(index) {
                Some(pose) => poses.push(PublicPose { pose_index: index, pose }),
                None => {
                    let err = CoordinationError::PoseNotFound { agent: self.id, index };
                    warn!(agent = self.id, error = %err, "public pose skipped");
                }
            }
        }
        self.outbox.push(BusMessage::PublicPoses(PublicPoses {
            owner: self.id,
            iteration: self.iteration,
            cluster_id: 0,
            poses,
        }));
    }

    fn broadcast_anchor(&mut self) {
        match self.optimizer.pose_estimate(0) {
            Some(pose) => {
                let anchor = Anchor {
                    owner: self.id,
                    iteration: self.iteration,
                    pose,
                };
                self.bootstrap.on_anchor(anchor.clone());
                self.outbox.push(BusMessage::Anchor(anchor));
            }
            None => {
                let err = CoordinationError::PoseNotFound { agent: self.id, index: 0 };
                warn!(agent = self.id, error = %err, "anchor not broadcast");
            }
        }
    }

    fn refresh_trajectory(&mut self) -> CoordinationResult<()> {
        let anchor = self.bootstrap.require_anchor()?.clone();
        match self.optimizer.trajectory_in_global_frame(&anchor) {
            Some(trajectory) => {
                self.trajectory = Some(trajectory);
                Ok(())
            }
            None => Err(CoordinationError::PoseGraphMissing),
        }
    }

    fn on_update_weight(&mut self, command: &Command) -> CoordinationResult<()> {
        if !self.state.is_running() {
            debug!(agent = self.id, state = %self.state, "UPDATE_WEIGHT ignored");
            return Ok(());
        }
        self.transition(AgentState::WeightUpdating)?;
        let Some(partition) = self.partition.as_ref() else {
            return Err(CoordinationError::PoseGraphMissing);
        };
        let optimizer = &self.optimizer;
        let round = self
            .weights
            .recompute(command.epoch, partition.responsible_edges(), |edge| optimizer.robust_weight(edge));
        for update in &round.updates {
            self.optimizer.set_shared_weight(update.edge, update.weight);
        }
        let locally_converged = round.max_delta < self.config.weight_convergence_threshold;
        info!(
            agent = self.id,
            round = round.round,
            edges = round.updates.len(),
            max_delta = round.max_delta,
            locally_converged,
            "weight round computed"
        );

        if let Some(log) = self.log.as_mut() {
            let records: Vec<WeightRoundRecord> = round
                .deltas
                .iter()
                .map(|(edge, delta)| WeightRoundRecord {
                    agent_id: self.id,
                    timestamp_ms: now_ms(),
                    round: round.round,
                    r1: edge.r1,
                    p1: edge.p1,
                    r2: edge.r2,
                    p2: edge.p2,
                    weight_delta: *delta,
                    converged: locally_converged,
                })
                .collect();
            if let Err(e) = log.append_weight_round(&records) {
                warn!(agent = self.id, error = %e, "weight log append failed");
            }
        }

        self.outbox.push(BusMessage::Weights(MeasurementWeights {
            publisher: self.id,
            weight_round: round.round,
            weights: round.updates.clone(),
        }));
        self.last_weight_report = Some((round.round, round.max_delta));
        self.emit_status();

        if self.is_root() {
            let team_round = self
                .team_round
                .get_or_insert_with(|| TeamWeightRound::new(command.epoch));
            team_round.record(self.id, round.round, round.max_delta);
        }
        Ok(())
    }

    fn terminate(&mut self, graceful: bool) -> CoordinationResult<()> {
        if self.state == AgentState::Terminated {
            return Ok(());
        }
        self.pending_update = None;
        self.pending_handoff = None;
        self.barrier.clear_deferral();
        if graceful && self.partition.is_some() {
            if let Err(e) = self.refresh_trajectory() {
                warn!(agent = self.id, error = %e, "final trajectory unavailable");
            }
        }
        self.transition(AgentState::Terminated)?;
        info!(agent = self.id, graceful, iteration = self.iteration, "terminated");
        self.emit_status();
        if self.config.complete_reset {
            self.reset()?;
            self.emit_status();
        }
        Ok(())
    }

    fn handle_status(&mut self, status: Status, now: Instant) -> CoordinationResult<()> {
        let agent = status.agent_id;
        if self.connectivity.on_heartbeat(agent, now)? {
            info!(agent = self.id, peer = agent, state = %status.state, "peer joined");
        }
        if let Some(previous) = self.peer_status.get(&agent) {
            if status.iteration < previous.iteration && status.state != AgentState::Idle {
                debug!(agent = self.id, peer = agent, "out-of-order status ignored");
                return Ok(());
            }
        }

        let digest_mismatch = match (&status.lifting_digest, self.bootstrap.lifting_digest()) {
            (Some(theirs), Some(ours)) if self.is_root() && theirs != ours => Some(theirs.clone()),
            _ => None,
        };

        if self.is_root() {
            if let Some(got) = digest_mismatch {
                warn!(agent = self.id, peer = agent, digest = %got, "peer holds a diverged lifting matrix");
                if let Some(lifting) = self.bootstrap.broadcast() {
                    self.outbox.push(BusMessage::LiftingMatrix(lifting));
                }
                self.peer_status.insert(agent, status);
                return Err(CoordinationError::LiftingMatrixMismatch {
                    expected: self.bootstrap.lifting_digest().unwrap_or_default().to_owned(),
                    got,
                });
            }
            if self.state.is_running()
                && matches!(status.state, AgentState::PoseGraphLoaded | AgentState::Initializing)
            {
                if status.shared_closures_ready {
                    let ack = Command::new(CommandKind::Initialize, self.id, agent, self.epoch);
                    self.outbox.push(BusMessage::Command(ack));
                } else {
                    debug!(agent = self.id, peer = agent, "peer still waiting on shared loop closures");
                }
            }
            if let (Some(round), Some(delta), Some(team_round)) =
                (status.weight_round, status.weight_max_delta, self.team_round.as_mut())
            {
                team_round.record(agent, round, delta);
            }
        }
        let running = status.state.is_running();
        self.peer_status.insert(agent, status);
        if self.is_root() && running && self.state.is_running() {
            self.on_disconnection_report(agent, now)?;
        }
        Ok(())
    }

    /// Root: re-elect when a running peer no longer hears the current token holder
    fn on_disconnection_report(&mut self, reporter: AgentId, now: Instant) -> CoordinationResult<()> {
        let Some(holder) = self.last_executor else {
            return Ok(());
        };
        if holder == reporter
            || holder == self.id
            || self.team_round.is_some()
            || self.reelected_at_epoch == Some(self.epoch)
        {
            return Ok(());
        }
        let Some(report) = self.peer_status.get(&reporter) else {
            return Ok(());
        };
        let lost_holder = report.epoch >= self.epoch
            && !report.connected_peers.contains(&holder)
            && report.connected_peers.iter().any(|p| *p != holder);
        if !lost_holder {
            return Ok(());
        }
        let active = self.connectivity.active_set();
        let Some(next) = self.scheduler.select_next(&active, holder) else {
            return Ok(());
        };
        warn!(agent = self.id, reporter, holder, next, epoch = self.epoch, "token holder unreachable from peer, re-electing");
        let command = Command::new(CommandKind::Update, self.id, next, self.epoch.saturating_add(1))
            .with_iteration(self.iteration)
            .with_weights_converged(self.convergence.is_converged());
        self.publish_command(command, now)?;
        self.reelected_at_epoch = Some(self.epoch);
        Ok(())
    }

    fn handle_public_poses(&mut self, msg: PublicPoses) -> CoordinationResult<()> {
        if msg.cluster_id != 0 {
            warn!(agent = self.id, owner = msg.owner, cluster = msg.cluster_id, "public poses from inactive cluster ignored");
            return Ok(());
        }
        let Some(partition) = self.partition.as_ref() else {
            return Ok(());
        };
        if msg.iteration < self.barrier.received(msg.owner) {
            debug!(agent = self.id, owner = msg.owner, iteration = msg.iteration, "stale public poses ignored");
            return Ok(());
        }
        let wanted = partition.neighbor_pose_indices(msg.owner);
        let matched: BTreeSet<_> = msg
            .poses
            .iter()
            .map(|p| p.pose_index)
            .filter(|index| wanted.contains(index))
            .collect();
        if matched.len() < wanted.len() {
            return Err(CoordinationError::CardinalityMismatch {
                requested: wanted.len(),
                received: matched.len(),
            });
        }
        for public in msg.poses {
            if wanted.contains(&public.pose_index) {
                self.optimizer.update_neighbor_pose(msg.owner, public.pose_index, public.pose);
            }
        }
        self.barrier.record_received(msg.owner, msg.iteration);
        Ok(())
    }

    fn handle_public_measurements(&mut self, msg: PublicMeasurements) -> CoordinationResult<()> {
        self.shared_closures_from.insert(msg.publisher);
        let Some(partition) = self.partition.as_ref() else {
            return Ok(());
        };
        let known: BTreeSet<_> = partition.shared_loop_closures.iter().map(|m| m.key()).collect();
        let unknown = msg
            .measurements
            .iter()
            .filter(|m| m.key().remote_endpoint(self.id).is_some() && !known.contains(&m.key()))
            .count();
        if unknown > 0 {
            return Err(CoordinationError::MalformedMeasurement {
                agent: self.id,
                reason: format!("{unknown} shared loop closures from agent {} missing locally", msg.publisher),
            });
        }
        Ok(())
    }

    fn handle_weights(&mut self, msg: MeasurementWeights) -> CoordinationResult<()> {
        let Some(partition) = self.partition.as_ref() else {
            return Ok(());
        };
        let shared: BTreeSet<_> = partition.shared_loop_closures.iter().map(|m| m.key()).collect();
        let mut rejected = 0;
        for update in &msg.weights {
            if !shared.contains(&update.edge) {
                continue;
            }
            if update.edge.responsible_agent() != msg.publisher {
                rejected += 1;
                continue;
            }
            if self.weights.apply(update) {
                self.optimizer.set_shared_weight(update.edge, update.weight.clamp(0.0, 1.0));
            }
        }
        if rejected > 0 {
            return Err(CoordinationError::MalformedMeasurement {
                agent: self.id,
                reason: format!("{rejected} weights published by non-responsible agent {}", msg.publisher),
            });
        }
        Ok(())
    }

    fn handle_lifting_matrix(&mut self, msg: &LiftingMatrixMsg) -> CoordinationResult<()> {
        match self.bootstrap.on_broadcast(msg)? {
            LiftingSync::Unchanged => Ok(()),
            LiftingSync::Adopted(matrix) => {
                self.optimizer.set_lifting_matrix(matrix);
                Ok(())
            }
            LiftingSync::Replaced { held, matrix } => {
                // Estimates lifted with the old matrix are discarded
                self.optimizer.set_lifting_matrix(matrix);
                if let Some(partition) = self.partition.as_ref() {
                    self.optimizer.set_pose_graph(partition);
                }
                Err(CoordinationError::LiftingMatrixMismatch {
                    expected: held,
                    got: msg.digest.clone(),
                })
            }
        }
    }

    fn release_lost(&mut self, change: &ActiveSetChange) {
        for peer in &change.lost {
            self.barrier.release(*peer);
        }
        for peer in &change.recovered {
            debug!(agent = self.id, peer, "peer back in active set");
        }
    }

    // ---- periodic tick ----

    /// Periodic work: connectivity, deferred updates, handoffs, root duties, heartbeat
    pub fn tick(&mut self, now: Instant) -> CoordinationResult<()> {
        let change = self.connectivity.tick(now);
        self.release_lost(&change);

        let result = self.tick_inner(now);
        self.emit_status();
        result
    }

    fn tick_inner(&mut self, now: Instant) -> CoordinationResult<()> {
        let handoff_due = self
            .pending_handoff
            .as_ref()
            .map(|(_, due)| now >= *due)
            .unwrap_or(false);
        if handoff_due {
            if let Some((handoff, _)) = self.pending_handoff.take() {
                self.publish_command(handoff, now)?;
            }
        }

        if self.pending_update.is_some() {
            self.try_pending_update(now)?;
        }

        if self.partition.is_some() && self.state != AgentState::Terminated && self.closures_unconfirmed() {
            self.publish_shared_closures();
        }

        if self.is_root() {
            return self.root_tick(now);
        }

        if self.state == AgentState::Initializing {
            if let Err(e) = self.bootstrap.record_init_attempt() {
                warn!(agent = self.id, error = %e, "distributed initialization failed");
                self.transition(AgentState::Terminated)?;
                if self.config.complete_reset {
                    self.reset()?;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn root_tick(&mut self, now: Instant) -> CoordinationResult<()> {
        let active: Vec<AgentId> = self.connectivity.active_set().into_iter().collect();
        if self.last_active_broadcast.as_ref() != Some(&active) {
            let command = Command::new(CommandKind::ActiveRobots, self.id, self.id, self.epoch)
                .with_active_robots(active.iter().copied());
            info!(agent = self.id, ?active, "broadcasting active set");
            self.outbox.push(BusMessage::Command(command));
            self.last_active_broadcast = Some(active);
        }

        match self.state {
            AgentState::Idle if self.staged_edges.is_some() => self.load_pose_graph(now),
            AgentState::PoseGraphLoaded => {
                let settled = self
                    .loaded_at
                    .map(|t| now.saturating_duration_since(t) >= self.config.settle_delay())
                    .unwrap_or(true);
                if settled {
                    self.start_run(now)?;
                    self.supervise(now)?;
                }
                Ok(())
            }
            AgentState::Optimizing | AgentState::WeightUpdating => self.supervise(now),
            _ => Ok(()),
        }
    }

    fn request_pose_graphs(&mut self, now: Instant) {
        let command = Command::new(CommandKind::RequestPoseGraph, self.id, self.id, self.epoch);
        self.outbox.push(BusMessage::Command(command));
        self.last_graph_request = Some(now);
    }

    fn start_run(&mut self, now: Instant) -> CoordinationResult<()> {
        self.transition(AgentState::Initializing)?;
        self.transition(AgentState::Optimizing)?;
        self.request_pose_graphs(now);
        if let Some(lifting) = self.bootstrap.broadcast() {
            self.outbox.push(BusMessage::LiftingMatrix(lifting));
        }
        info!(agent = self.id, "run started");
        Ok(())
    }

    fn supervise(&mut self, now: Instant) -> CoordinationResult<()> {
        let active = self.connectivity.active_set();
        let peers: Vec<AgentId> = active.iter().copied().filter(|a| *a != self.id).collect();

        let idle_peer = peers.iter().any(|p| {
            self.peer_status
                .get(p)
                .map(|s| s.state == AgentState::Idle)
                .unwrap_or(false)
        });
        let request_due = self
            .last_graph_request
            .map(|t| now.saturating_duration_since(t) >= self.config.settle_delay())
            .unwrap_or(true);
        if idle_peer && request_due {
            self.request_pose_graphs(now);
        }

        let round_complete = self
            .team_round
            .as_ref()
            .map(|round| round.is_complete(&active))
            .unwrap_or(false);
        if round_complete {
            return self.close_weight_round(now);
        }

        if self.should_terminate(&peers) {
            return self.issue_terminate(now);
        }

        if self.pending_handoff.is_some() || self.pending_update.is_some() {
            return Ok(());
        }

        if self.epoch == 0 {
            let all_running = peers.iter().all(|p| {
                self.peer_status
                    .get(p)
                    .map(|s| s.state.is_running())
                    .unwrap_or(false)
            });
            if all_running && self.shared_closures_ready() {
                if let Some(first) = self.scheduler.select_first(&active) {
                    info!(agent = self.id, first, team = ?active, "issuing first update");
                    let command = Command::new(CommandKind::Update, self.id, first, 1).with_iteration(self.iteration);
                    return self.publish_command(command, now);
                }
            }
            return Ok(());
        }

        let stalled = self
            .last_step_seen
            .map(|t| now.saturating_duration_since(t) > self.config.timeout())
            .unwrap_or(false);
        let executor_lost = self
            .last_executor
            .map(|e| !self.connectivity.is_active(e))
            .unwrap_or(false);

        if self.team_round.is_some() {
            if stalled {
                warn!(agent = self.id, "weight round stalled, closing with partial reports");
                return self.close_weight_round(now);
            }
            return Ok(());
        }

        if stalled || executor_lost {
            let last = self.last_executor.unwrap_or(self.id);
            let next = self.scheduler.select_next(&active, last).unwrap_or(self.id);
            warn!(agent = self.id, last, next, stalled, executor_lost, "issuing recovery update");
            let command = Command::new(CommandKind::Update, self.id, next, self.epoch.saturating_add(1))
                .with_iteration(self.iteration)
                .with_weights_converged(self.convergence.is_converged());
            return self.publish_command(command, now);
        }
        Ok(())
    }

    fn should_terminate(&self, peers: &[AgentId]) -> bool {
        if self.epoch == 0 {
            return false;
        }
        if self.epoch >= self.config.optimizer.max_iterations {
            return true;
        }
        self.ready_to_terminate
            && peers.iter().all(|p| {
                self.peer_status
                    .get(p)
                    .map(|s| s.ready_to_terminate)
                    .unwrap_or(false)
            })
    }

    fn issue_terminate(&mut self, now: Instant) -> CoordinationResult<()> {
        info!(agent = self.id, epoch = self.epoch, "terminating team");
        self.broadcast_anchor();
        let command = Command::new(CommandKind::Terminate, self.id, self.id, self.epoch);
        self.publish_command(command, now)
    }

    fn close_weight_round(&mut self, now: Instant) -> CoordinationResult<()> {
        let Some(round) = self.team_round.take() else {
            return Ok(());
        };
        let active = self.connectivity.active_set();
        let missing = round.missing(&active);
        if !missing.is_empty() {
            warn!(agent = self.id, round = round.round(), ?missing, "weight round closed without every report");
        }
        let max_delta = round.max_delta(&active);
        let converged = self.convergence.record_round(max_delta);
        info!(agent = self.id, round = round.round(), max_delta, converged, "weight round closed");

        let last = self.last_executor.unwrap_or(self.id);
        let next = self.scheduler.select_next(&active, last).unwrap_or(self.id);
        let command = Command::new(CommandKind::Update, self.id, next, self.epoch.saturating_add(1))
            .with_iteration(self.iteration)
            .with_weights_converged(converged);
        self.publish_command(command, now)
    }
}
