//! Bus payloads exchanged between agents.
//!
//! Every payload is transient: broadcast once, consumed, and superseded by the
//! next one. None of these types carry behavior beyond small constructors.

use dpgo_core::{AgentId, EdgeKey, Matrix, Pose, PoseIndex, RelativeMeasurement};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem::size_of;

/// Command type carried on the shared command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    /// Ask every agent to load its local pose graph
    RequestPoseGraph,
    /// Start, or acknowledge, the addressed agent's initialization
    Initialize,
    /// The addressed agent performs one optimization step
    Update,
    /// Every agent recomputes robust weights for its responsible edges
    UpdateWeight,
    /// Graceful stop: finish the in-flight step and publish the final trajectory
    Terminate,
    /// Immediate stop
    HardTerminate,
    /// Authoritative active set from the root
    ActiveRobots,
    /// Diagnostics only
    Noop,
    /// Any command type this build does not recognise
    #[serde(other)]
    Unknown,
}

impl CommandKind {
    /// Commands that cause an optimization or weight step, and are epoch-gated
    pub fn is_step(&self) -> bool {
        matches!(self, CommandKind::Update | CommandKind::UpdateWeight)
    }

    /// Commands every agent acts on, regardless of `executing_agent`
    pub fn is_team_wide(&self) -> bool {
        matches!(
            self,
            CommandKind::RequestPoseGraph
                | CommandKind::UpdateWeight
                | CommandKind::Terminate
                | CommandKind::HardTerminate
                | CommandKind::ActiveRobots
        )
    }
}

/// A command broadcast on the shared channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command type
    pub kind: CommandKind,
    /// Agent that published the command
    pub publishing_agent: AgentId,
    /// Agent addressed by the command
    pub executing_agent: AgentId,
    /// Monotonic round number
    pub epoch: u64,
    /// Publisher's local update count when it published
    pub publisher_iteration: u64,
    /// Team-wide robust weight convergence, propagated through handoffs
    pub weights_converged: bool,
    /// Active set payload of ACTIVE_ROBOTS
    #[serde(default)]
    pub active_robots: Vec<AgentId>,
}

impl Command {
    /// Command of `kind` with an empty payload
    pub fn new(kind: CommandKind, publishing_agent: AgentId, executing_agent: AgentId, epoch: u64) -> Self {
        Self {
            kind,
            publishing_agent,
            executing_agent,
            epoch,
            publisher_iteration: 0,
            weights_converged: false,
            active_robots: Vec::new(),
        }
    }

    /// Set the publisher's iteration
    pub fn with_iteration(mut self, iteration: u64) -> Self {
        self.publisher_iteration = iteration;
        self
    }

    /// Set the propagated weight convergence flag
    pub fn with_weights_converged(mut self, converged: bool) -> Self {
        self.weights_converged = converged;
        self
    }

    /// Set the active set payload
    pub fn with_active_robots(mut self, robots: impl IntoIterator<Item = AgentId>) -> Self {
        self.active_robots = robots.into_iter().collect();
        self
    }

    /// True if `agent` should act on this command
    pub fn addresses(&self, agent: AgentId) -> bool {
        self.kind.is_team_wide() || self.executing_agent == agent
    }
}

/// Protocol state of one agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    /// No pose graph loaded
    Idle,
    /// Local partition loaded and validated
    PoseGraphLoaded,
    /// Bootstrap handshake in progress
    Initializing,
    /// Taking part in optimization rounds
    Optimizing,
    /// Recomputing robust weights
    WeightUpdating,
    /// Run finished
    Terminated,
}

impl AgentState {
    /// States in which the agent takes part in UPDATE rounds
    pub fn is_running(&self) -> bool {
        matches!(self, AgentState::Optimizing | AgentState::WeightUpdating)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Idle => "IDLE",
            AgentState::PoseGraphLoaded => "POSEGRAPH_LOADED",
            AgentState::Initializing => "INITIALIZING",
            AgentState::Optimizing => "OPTIMIZING",
            AgentState::WeightUpdating => "WEIGHT_UPDATING",
            AgentState::Terminated => "TERMINATED",
        };
        write!(f, "{name}")
    }
}

/// Heartbeat; its arrival time is the sender's "last seen" timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// Reporting agent
    pub agent_id: AgentId,
    /// Current protocol state
    pub state: AgentState,
    /// Local update count
    pub iteration: u64,
    /// Highest step epoch the agent has seen
    pub epoch: u64,
    /// Peers the agent currently considers reachable
    pub connected_peers: Vec<AgentId>,
    /// Last step's relative change is under tolerance and weights are settled
    pub ready_to_terminate: bool,
    /// Weight round this report answers, if any
    pub weight_round: Option<u64>,
    /// Largest weight change of that round
    pub weight_max_delta: Option<f64>,
    /// Local weights converged in that round
    pub weights_converged: bool,
    /// Digest of the held lifting matrix
    pub lifting_digest: Option<String>,
    /// Shared loop closures received from every active neighbor
    #[serde(default)]
    pub shared_closures_ready: bool,
}

/// Estimate of one pose that is an endpoint of a shared loop closure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicPose {
    /// Pose index on the owner
    pub pose_index: PoseIndex,
    /// Lifted pose
    pub pose: Pose,
}

/// Batch of public poses from one agent at one iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicPoses {
    /// Owning agent
    pub owner: AgentId,
    /// Owner's update count when the poses were produced
    pub iteration: u64,
    /// Cluster the poses were merged into; only cluster 0 is accepted
    pub cluster_id: u32,
    /// Poses
    pub poses: Vec<PublicPose>,
}

/// Shared loop closures an agent holds, published once its pose graph is loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicMeasurements {
    /// Publishing agent
    pub publisher: AgentId,
    /// Publisher's shared loop closures
    pub measurements: Vec<RelativeMeasurement>,
}

/// Robust weight of one shared loop closure
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SharedWeight {
    /// Edge endpoints
    pub edge: EdgeKey,
    /// Weight in [0, 1]
    pub weight: f64,
}

/// Weights published by the responsible agent after a weight round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementWeights {
    /// Responsible agent
    pub publisher: AgentId,
    /// Weight round (epoch of the UPDATE_WEIGHT command)
    pub weight_round: u64,
    /// Updated weights
    pub weights: Vec<SharedWeight>,
}

/// Lifting matrix broadcast by the root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiftingMatrixMsg {
    /// Owner (the root)
    pub owner: AgentId,
    /// Matrix
    pub matrix: Matrix,
    /// Digest of `matrix`
    pub digest: String,
}

/// Global anchor broadcast by the root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    /// Owner (the root)
    pub owner: AgentId,
    /// Root iteration the anchor was taken at
    pub iteration: u64,
    /// Root's pose 0
    pub pose: Pose,
}

/// Bootstrap query for the root's lifting matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiftingMatrixRequest {
    /// Asking agent
    pub requester: AgentId,
    /// Agent the requester believes owns the matrix
    pub robot_id: AgentId,
}

/// Answer to a [`LiftingMatrixRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiftingMatrixResponse {
    /// Matrix
    pub matrix: Matrix,
    /// Digest the root computed for `matrix`
    pub digest: String,
}

/// Envelope for everything on the broadcast bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusMessage {
    /// Command channel
    #[serde(rename = "command")]
    Command(Command),
    /// Heartbeat channel
    #[serde(rename = "status")]
    Status(Status),
    /// Public pose channel
    #[serde(rename = "public_poses")]
    PublicPoses(PublicPoses),
    /// Shared loop closure exchange
    #[serde(rename = "public_measurements")]
    PublicMeasurements(PublicMeasurements),
    /// Weight channel
    #[serde(rename = "weights")]
    Weights(MeasurementWeights),
    /// Lifting matrix broadcast
    #[serde(rename = "lifting_matrix")]
    LiftingMatrix(LiftingMatrixMsg),
    /// Anchor broadcast
    #[serde(rename = "anchor")]
    Anchor(Anchor),
}

impl BusMessage {
    /// Agent that published the message
    pub fn publisher(&self) -> AgentId {
        match self {
            BusMessage::Command(c) => c.publishing_agent,
            BusMessage::Status(s) => s.agent_id,
            BusMessage::PublicPoses(p) => p.owner,
            BusMessage::PublicMeasurements(m) => m.publisher,
            BusMessage::Weights(w) => w.publisher,
            BusMessage::LiftingMatrix(l) => l.owner,
            BusMessage::Anchor(a) => a.owner,
        }
    }

    /// Short name for logging
    pub fn kind_name(&self) -> &'static str {
        match self {
            BusMessage::Command(_) => "command",
            BusMessage::Status(_) => "status",
            BusMessage::PublicPoses(_) => "public_poses",
            BusMessage::PublicMeasurements(_) => "public_measurements",
            BusMessage::Weights(_) => "weights",
            BusMessage::LiftingMatrix(_) => "lifting_matrix",
            BusMessage::Anchor(_) => "anchor",
        }
    }

    /// Size of the numeric pose and measurement data carried; control traffic counts as zero
    pub fn payload_bytes(&self) -> usize {
        match self {
            BusMessage::Command(_) | BusMessage::Status(_) => 0,
            BusMessage::PublicPoses(p) => p
                .poses
                .iter()
                .map(|public| size_of::<PoseIndex>() + matrix_bytes(&public.pose))
                .sum(),
            BusMessage::PublicMeasurements(m) => m.measurements.iter().map(measurement_bytes).sum(),
            BusMessage::Weights(w) => w.weights.len() * size_of::<SharedWeight>(),
            BusMessage::LiftingMatrix(l) => matrix_bytes(&l.matrix),
            BusMessage::Anchor(a) => matrix_bytes(&a.pose),
        }
    }
}

fn matrix_bytes(matrix: &Matrix) -> usize {
    matrix.as_slice().len() * size_of::<f64>()
}

fn measurement_bytes(m: &RelativeMeasurement) -> usize {
    2 * size_of::<AgentId>()
        + 2 * size_of::<PoseIndex>()
        + matrix_bytes(&m.rotation)
        + (m.translation.len() + 3) * size_of::<f64>()
}
