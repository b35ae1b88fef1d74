//! Error types for the coordination layer.
//!
//! Only the bootstrap failures are fatal to an agent's run. Everything else is
//! reported to the dispatch loop, logged, and treated as "no data this round".

use dpgo_core::{AgentId, CoreError, PoseIndex};
use thiserror::Error;

/// Errors that can occur while coordinating a team
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The lifting-matrix query went unanswered within the timeout
    #[error("Bootstrap query to agent {root} timed out after {timeout_ms} ms")]
    BootstrapTimeout {
        /// Agent queried
        root: AgentId,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// The lifting-matrix query was refused or the channel closed
    #[error("Bootstrap query refused: {0}")]
    BootstrapRefused(String),

    /// A received lifting matrix disagrees with the claimed or held copy
    #[error("Lifting matrix inconsistent: expected digest {expected}, got {got}")]
    LiftingMatrixMismatch {
        /// Digest held or claimed
        expected: String,
        /// Digest computed
        got: String,
    },

    /// Lifting matrix has the wrong shape for the configured rank/dimension
    #[error("Lifting matrix shape {rows}x{cols} does not match r={rank}, d={dimension}")]
    LiftingMatrixShape {
        /// Rows received
        rows: usize,
        /// Columns received
        cols: usize,
        /// Configured relaxation rank
        rank: usize,
        /// Configured dimension
        dimension: usize,
    },

    /// Lifting matrix is not available on this agent
    #[error("Lifting matrix unavailable on agent {0}")]
    LiftingMatrixUnavailable(AgentId),

    /// Readiness handshake exhausted its attempts
    #[error("Distributed initialization failed after {attempts} attempts")]
    InitializationExhausted {
        /// Attempts made
        attempts: u32,
    },

    /// Transition not allowed by the agent state machine
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// State before
        from: String,
        /// Requested state
        to: String,
    },

    /// Requested pose index does not exist
    #[error("Pose {index} not found on agent {agent}")]
    PoseNotFound {
        /// Agent queried
        agent: AgentId,
        /// Missing index
        index: PoseIndex,
    },

    /// Measurement does not reference this agent
    #[error("Malformed measurement on agent {agent}: {reason}")]
    MalformedMeasurement {
        /// Receiving agent
        agent: AgentId,
        /// What was wrong
        reason: String,
    },

    /// A response carried a different number of items than requested
    #[error("Response cardinality mismatch: requested {requested}, received {received}")]
    CardinalityMismatch {
        /// Items requested
        requested: usize,
        /// Items received
        received: usize,
    },

    /// Message from an agent outside the configured team
    #[error("Unknown peer {0}")]
    UnknownPeer(AgentId),

    /// No global anchor has been received yet
    #[error("Global anchor not yet available")]
    AnchorUnavailable,

    /// Operation requires a loaded pose graph
    #[error("Pose graph not loaded")]
    PoseGraphMissing,

    /// Persisted log failure
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Bus closed underneath the runtime
    #[error("Message bus closed")]
    BusClosed,
}

impl CoordinationError {
    /// True for errors that end this agent's run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordinationError::BootstrapTimeout { .. }
                | CoordinationError::BootstrapRefused(_)
                | CoordinationError::BusClosed
        )
    }
}

/// Result type for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;
