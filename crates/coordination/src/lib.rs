//! DPGO coordination layer
//!
//! Sequences which agent of a robot team runs its local pose-graph
//! optimization step when, bounds how stale the neighbor data used by a step
//! may be, excludes unresponsive peers, distributes the lifting matrix and
//! global anchor, and runs the robust weight convergence rounds.
//!
//! Components, leaves first:
//! - [`messages`]: bus payloads
//! - [`connectivity`]: last-seen table and active set
//! - [`barrier`]: bounded-staleness synchronization barrier
//! - [`scheduler`]: next-executor selection
//! - [`bootstrap`]: lifting matrix distribution, readiness handshake, anchor
//! - [`weights`]: robust weight rounds and team convergence
//! - [`agent`]: command dispatcher and state machine
//! - [`bus`] and [`runtime`]: in-process bus and async event loop

pub mod agent;
pub mod barrier;
pub mod bootstrap;
pub mod bus;
pub mod connectivity;
pub mod error;
pub mod iteration_log;
pub mod messages;
pub mod optimizer;
pub mod runtime;
pub mod scheduler;
pub mod weights;

pub use agent::Agent;
pub use barrier::{BarrierDecision, SyncBarrier};
pub use bootstrap::{canonical_lifting_matrix, BootstrapCoordinator, LiftingSync};
pub use bus::{LiftingQuery, LocalBus, DEFAULT_BUS_CAPACITY};
pub use connectivity::{ActiveSetChange, ConnectivityMonitor};
pub use error::{CoordinationError, CoordinationResult};
pub use iteration_log::{IterationLog, IterationRecord, WeightRoundRecord};
pub use messages::{
    AgentState, Anchor, BusMessage, Command, CommandKind, LiftingMatrixMsg, LiftingMatrixRequest,
    LiftingMatrixResponse, MeasurementWeights, PublicMeasurements, PublicPose, PublicPoses,
    SharedWeight, Status,
};
pub use optimizer::{OptimizeResult, Optimizer};
pub use runtime::AgentRuntime;
pub use scheduler::Scheduler;
pub use weights::{LocalWeightRound, TeamWeightRound, WeightConvergence, WeightTable};
