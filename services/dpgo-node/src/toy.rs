//! Toy local optimizer and synthetic team graph for in-process runs.

use dpgo_coordination::{OptimizeResult, Optimizer};
use dpgo_core::{AgentId, EdgeKey, Matrix, Pose, PoseGraphPartition, PoseIndex, RelativeMeasurement};
use std::collections::BTreeMap;

/// Residual norm beyond which a loop closure is treated as an outlier
const TRUNCATION_NORM: f64 = 10.0;

/// Cost the toy optimizer converges to
const COST_FLOOR: f64 = 1.0;

/// Halves its excess cost every step; truncated least squares robust weights.
#[derive(Debug, Default)]
pub struct ToyOptimizer {
    lifting: Option<Matrix>,
    poses: Vec<Pose>,
    neighbor_poses: BTreeMap<(AgentId, PoseIndex), Pose>,
    shared_weights: BTreeMap<EdgeKey, f64>,
    cost: f64,
}

impl ToyOptimizer {
    fn shape(&self) -> (usize, usize) {
        self.lifting
            .as_ref()
            .map(|m| (m.rows(), m.cols()))
            .unwrap_or((5, 3))
    }

    /// Cached neighbor poses
    pub fn neighbor_pose_count(&self) -> usize {
        self.neighbor_poses.len()
    }

    /// Weight currently applied to `edge`
    pub fn shared_weight(&self, edge: &EdgeKey) -> Option<f64> {
        self.shared_weights.get(edge).copied()
    }
}

impl Optimizer for ToyOptimizer {
    fn optimize(&mut self) -> OptimizeResult {
        let before = self.cost;
        self.cost = COST_FLOOR + (self.cost - COST_FLOOR) * 0.5;
        OptimizeResult {
            success: !self.poses.is_empty(),
            cost_before: before,
            cost_after: self.cost,
        }
    }

    fn pose_estimate(&self, index: PoseIndex) -> Option<Pose> {
        self.poses.get(index as usize).cloned()
    }

    fn set_lifting_matrix(&mut self, matrix: Matrix) {
        self.lifting = Some(matrix);
    }

    fn lifting_matrix(&self) -> Option<Matrix> {
        self.lifting.clone()
    }

    fn set_pose_graph(&mut self, partition: &PoseGraphPartition) {
        let (r, d) = self.shape();
        self.poses = (0..partition.num_poses())
            .map(|i| {
                let mut pose = Matrix::identity(r, d + 1);
                pose.set(0, d, i as f64);
                pose
            })
            .collect();
        self.cost = COST_FLOOR + partition.edge_count() as f64;
    }

    fn update_neighbor_pose(&mut self, owner: AgentId, index: PoseIndex, pose: Pose) {
        self.neighbor_poses.insert((owner, index), pose);
    }

    fn trajectory_in_global_frame(&self, anchor: &Pose) -> Option<Matrix> {
        let (_, d) = self.shape();
        if self.poses.is_empty() || anchor.cols() != d + 1 {
            return None;
        }
        let mut trajectory = Matrix::zeros(d, (d + 1) * self.poses.len());
        for (i, pose) in self.poses.iter().enumerate() {
            for row in 0..d {
                for col in 0..=d {
                    let mut value = pose.get(row, col)?;
                    if col == d {
                        value -= anchor.get(row, d)?;
                    }
                    trajectory.set(row, i * (d + 1) + col, value);
                }
            }
        }
        Some(trajectory)
    }

    fn robust_weight(&self, edge: &RelativeMeasurement) -> Option<f64> {
        let norm = edge.translation.iter().map(|t| t * t).sum::<f64>().sqrt();
        norm.is_finite()
            .then_some(if norm > TRUNCATION_NORM { 0.0 } else { 1.0 })
    }

    fn set_shared_weight(&mut self, edge: EdgeKey, weight: f64) {
        self.shared_weights.insert(edge, weight);
    }

    fn num_poses(&self) -> usize {
        self.poses.len()
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

fn edge(r1: AgentId, p1: PoseIndex, r2: AgentId, p2: PoseIndex, translation: [f64; 3]) -> RelativeMeasurement {
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

/// Per-robot edge lists: an odometry chain per robot, an inlier closure
/// between consecutive robots and a gross outlier on every other link.
pub fn team_graph(num_robots: usize, poses_per_robot: u32) -> Vec<Vec<RelativeMeasurement>> {
    let last = poses_per_robot.saturating_sub(1);
    let mut graphs: Vec<Vec<RelativeMeasurement>> = (0..num_robots as AgentId)
        .map(|r| (0..last).map(|i| edge(r, i, r, i + 1, [1.0, 0.0, 0.0])).collect())
        .collect();
    for r in 0..(num_robots as AgentId).saturating_sub(1) {
        let mut shared = vec![edge(r, last, r + 1, 0, [0.5, 1.0, 0.0])];
        if r % 2 == 0 {
            shared.push(edge(r, 0, r + 1, last, [80.0, 35.0, -12.0]));
        }
        for closure in shared {
            graphs[r as usize + 1].push(closure.clone());
            graphs[r as usize].push(closure);
        }
    }
    graphs
}
