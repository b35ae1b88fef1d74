//! Seam to the local numerical optimizer.
//!
//! The coordination layer never looks inside a pose estimate. It only moves
//! lifted poses, lifting matrices and weights between agents and asks the
//! optimizer to take a step.

use dpgo_core::{AgentId, EdgeKey, Matrix, Pose, PoseGraphPartition, PoseIndex, RelativeMeasurement};

/// Outcome of one local optimization step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizeResult {
    /// Step produced a usable iterate
    pub success: bool,
    /// Local cost before the step
    pub cost_before: f64,
    /// Local cost after the step
    pub cost_after: f64,
}

impl OptimizeResult {
    /// |before - after| / max(|before|, tiny)
    pub fn relative_change(&self) -> f64 {
        let scale = self.cost_before.abs().max(f64::EPSILON);
        (self.cost_before - self.cost_after).abs() / scale
    }
}

/// Local optimization routine of one agent
pub trait Optimizer: Send {
    /// Take one local step using the current graph and cached neighbor poses
    fn optimize(&mut self) -> OptimizeResult;

    /// Lifted estimate of a local pose
    fn pose_estimate(&self, index: PoseIndex) -> Option<Pose>;

    /// Install the shared lifting matrix
    fn set_lifting_matrix(&mut self, matrix: Matrix);

    /// Held lifting matrix
    fn lifting_matrix(&self) -> Option<Matrix>;

    /// Install this agent's pose-graph partition
    fn set_pose_graph(&mut self, partition: &PoseGraphPartition);

    /// Cache a neighbor's public pose
    fn update_neighbor_pose(&mut self, owner: AgentId, index: PoseIndex, pose: Pose);

    /// Local trajectory mapped into the global frame through `anchor`
    fn trajectory_in_global_frame(&self, anchor: &Pose) -> Option<Matrix>;

    /// Robust weight statistic of a shared loop closure at the current estimate
    fn robust_weight(&self, edge: &RelativeMeasurement) -> Option<f64>;

    /// Apply a shared loop closure's weight
    fn set_shared_weight(&mut self, edge: EdgeKey, weight: f64);

    /// Number of local poses
    fn num_poses(&self) -> usize;

    /// Drop the graph, estimates, cached neighbor poses and lifting matrix
    fn reset(&mut self);
}
