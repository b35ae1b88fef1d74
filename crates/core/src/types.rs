//! Core types shared by every agent: identifiers, dense matrices and pose-graph edges.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

/// Identifier of a participating robot/agent
pub type AgentId = u32;

/// Index of a pose inside one agent's trajectory
pub type PoseIndex = u32;

/// Agent that owns the lifting matrix and the global anchor
pub const ROOT_AGENT: AgentId = 0;

/// Dense row-major matrix used for lifted poses, lifting matrices and trajectories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Create a matrix from row-major data
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        let expected = rows * cols;
        if data.len() != expected {
            return Err(CoreError::MatrixShape {
                rows,
                cols,
                expected,
                got: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// All-zero matrix
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Rectangular identity: ones on the main diagonal
    pub fn identity(rows: usize, cols: usize) -> Self {
        let mut m = Self::zeros(rows, cols);
        for i in 0..rows.min(cols) {
            m.data[i * cols + i] = 1.0;
        }
        m
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Row-major element slice
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Element at (row, col)
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row < self.rows && col < self.cols {
            Some(self.data[row * self.cols + col])
        } else {
            None
        }
    }

    /// Set element at (row, col); out-of-range writes are ignored
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        if row < self.rows && col < self.cols {
            self.data[row * self.cols + col] = value;
        }
    }

    /// Hex BLAKE3 digest over shape and the little-endian bytes of every element.
    ///
    /// Two matrices share a digest only if they are bit-identical.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.rows as u64).to_le_bytes());
        hasher.update(&(self.cols as u64).to_le_bytes());
        for value in &self.data {
            hasher.update(&value.to_le_bytes());
        }
        hex::encode(hasher.finalize().as_bytes())
    }

    /// Bitwise equality (distinguishes -0.0 from 0.0, NaN payloads compare by bits)
    pub fn bit_identical(&self, other: &Matrix) -> bool {
        self.rows == other.rows
            && self.cols == other.cols
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

/// Lifted pose estimate, an `r x (d + 1)` block
pub type Pose = Matrix;

/// Endpoints of a relative measurement, used as the key of a shared edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeKey {
    /// First robot
    pub r1: AgentId,
    /// Pose index on the first robot
    pub p1: PoseIndex,
    /// Second robot
    pub r2: AgentId,
    /// Pose index on the second robot
    pub p2: PoseIndex,
}

impl EdgeKey {
    /// Agent that owns the robust weight of this edge: the lower id
    pub fn responsible_agent(&self) -> AgentId {
        self.r1.min(self.r2)
    }

    /// The endpoint that is not `agent`, if `agent` is an endpoint of a shared edge
    pub fn remote_endpoint(&self, agent: AgentId) -> Option<(AgentId, PoseIndex)> {
        if self.r1 == agent && self.r2 != agent {
            Some((self.r2, self.p2))
        } else if self.r2 == agent && self.r1 != agent {
            Some((self.r1, self.p1))
        } else {
            None
        }
    }

    /// The endpoint that is `agent`
    pub fn local_endpoint(&self, agent: AgentId) -> Option<PoseIndex> {
        if self.r1 == agent {
            Some(self.p1)
        } else if self.r2 == agent {
            Some(self.p2)
        } else {
            None
        }
    }
}

/// Classification of an edge relative to its endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementKind {
    /// Same robot, consecutive poses
    Odometry,
    /// Same robot, non-consecutive poses
    PrivateLoopClosure,
    /// Different robots
    SharedLoopClosure,
}

/// Relative rigid-body measurement between two poses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativeMeasurement {
    /// First robot
    pub r1: AgentId,
    /// Pose index on the first robot
    pub p1: PoseIndex,
    /// Second robot
    pub r2: AgentId,
    /// Pose index on the second robot
    pub p2: PoseIndex,
    /// Relative rotation, `d x d`
    pub rotation: Matrix,
    /// Relative translation, length `d`
    pub translation: Vec<f64>,
    /// Rotational precision
    pub kappa: f64,
    /// Translational precision
    pub tau: f64,
    /// Robust weight in [0, 1]
    pub weight: f64,
}

impl RelativeMeasurement {
    /// Endpoint key
    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            r1: self.r1,
            p1: self.p1,
            r2: self.r2,
            p2: self.p2,
        }
    }

    /// Odometry, private loop closure or shared loop closure
    pub fn kind(&self) -> MeasurementKind {
        if self.r1 == self.r2 {
            if self.p1.checked_add(1) == Some(self.p2) {
                MeasurementKind::Odometry
            } else {
                MeasurementKind::PrivateLoopClosure
            }
        } else {
            MeasurementKind::SharedLoopClosure
        }
    }

    /// True if `agent` is one of the two endpoints
    pub fn involves(&self, agent: AgentId) -> bool {
        self.r1 == agent || self.r2 == agent
    }
}

/// One agent's share of the global pose graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseGraphPartition {
    /// Owning agent
    pub agent_id: AgentId,
    /// Consecutive same-robot edges
    pub odometry: Vec<RelativeMeasurement>,
    /// Non-consecutive same-robot edges
    pub private_loop_closures: Vec<RelativeMeasurement>,
    /// Edges to other robots
    pub shared_loop_closures: Vec<RelativeMeasurement>,
}

impl PoseGraphPartition {
    /// Split raw edges into the three edge classes.
    ///
    /// Edges that do not reference `agent_id` as an endpoint are discarded and
    /// returned separately.
    pub fn from_edges(
        agent_id: AgentId,
        edges: Vec<RelativeMeasurement>,
    ) -> (Self, Vec<RelativeMeasurement>) {
        let mut partition = Self {
            agent_id,
            ..Self::default()
        };
        let mut rejected = Vec::new();

        for edge in edges {
            if !edge.involves(agent_id) {
                warn!(
                    agent = agent_id,
                    r1 = edge.r1,
                    r2 = edge.r2,
                    "discarding measurement that does not involve this agent"
                );
                rejected.push(edge);
                continue;
            }
            match edge.kind() {
                MeasurementKind::Odometry => partition.odometry.push(edge),
                MeasurementKind::PrivateLoopClosure => partition.private_loop_closures.push(edge),
                MeasurementKind::SharedLoopClosure => partition.shared_loop_closures.push(edge),
            }
        }

        (partition, rejected)
    }

    /// Number of local poses implied by the edges (highest local index + 1)
    pub fn num_poses(&self) -> usize {
        let id = self.agent_id;
        self.odometry
            .iter()
            .chain(self.private_loop_closures.iter())
            .chain(self.shared_loop_closures.iter())
            .flat_map(|m| {
                let mut v = Vec::with_capacity(2);
                if m.r1 == id {
                    v.push(m.p1);
                }
                if m.r2 == id {
                    v.push(m.p2);
                }
                v
            })
            .max()
            .map(|p| p as usize + 1)
            .unwrap_or(0)
    }

    /// Agents this partition shares at least one loop closure with
    pub fn neighbors(&self) -> BTreeSet<AgentId> {
        self.shared_loop_closures
            .iter()
            .filter_map(|m| m.key().remote_endpoint(self.agent_id).map(|(r, _)| r))
            .collect()
    }

    /// Local pose indices that are endpoints of shared loop closures
    pub fn public_pose_indices(&self) -> BTreeSet<PoseIndex> {
        self.shared_loop_closures
            .iter()
            .filter_map(|m| m.key().local_endpoint(self.agent_id))
            .collect()
    }

    /// Pose indices of `neighbor` this partition needs estimates for
    pub fn neighbor_pose_indices(&self, neighbor: AgentId) -> BTreeSet<PoseIndex> {
        self.shared_loop_closures
            .iter()
            .filter_map(|m| m.key().remote_endpoint(self.agent_id))
            .filter(|(r, _)| *r == neighbor)
            .map(|(_, p)| p)
            .collect()
    }

    /// Shared edges whose robust weight this agent owns
    pub fn responsible_edges(&self) -> impl Iterator<Item = &RelativeMeasurement> {
        let id = self.agent_id;
        self.shared_loop_closures
            .iter()
            .filter(move |m| m.key().responsible_agent() == id)
    }

    /// Total edge count
    pub fn edge_count(&self) -> usize {
        self.odometry.len() + self.private_loop_closures.len() + self.shared_loop_closures.len()
    }
}
