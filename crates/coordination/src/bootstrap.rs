//! Bootstrap coordinator
//!
//! Distributes the root's lifting matrix, runs the bounded readiness handshake
//! and caches the global anchor. The root owns the canonical copies; every
//! consistency check happens on the requesting side.

use crate::error::{CoordinationError, CoordinationResult};
use crate::messages::{Anchor, LiftingMatrixMsg, LiftingMatrixRequest, LiftingMatrixResponse};
use dpgo_core::{AgentId, Matrix, Pose, ROOT_AGENT};
use tracing::{debug, info, warn};

/// Root's canonical lifting matrix: the first `d` columns of the `r x r` identity
pub fn canonical_lifting_matrix(rank: usize, dimension: usize) -> Matrix {
    Matrix::identity(rank, dimension)
}

/// Outcome of a root lifting matrix broadcast
#[derive(Debug, Clone, PartialEq)]
pub enum LiftingSync {
    /// Held copy already matches, or the broadcast does not apply
    Unchanged,
    /// No copy was held; the root's is now installed
    Adopted(Matrix),
    /// Held copy diverged and was overwritten with the root's
    Replaced {
        /// Digest of the discarded copy
        held: String,
        /// Root's matrix
        matrix: Matrix,
    },
}

/// Per-agent bootstrap state
#[derive(Debug)]
pub struct BootstrapCoordinator {
    agent_id: AgentId,
    rank: usize,
    dimension: usize,
    max_init_steps: u32,
    init_steps: u32,
    lifting: Option<(Matrix, String)>,
    anchor: Option<Anchor>,
}

impl BootstrapCoordinator {
    /// Coordinator for `agent_id` with relaxation rank `rank` and dimension `dimension`
    pub fn new(agent_id: AgentId, rank: usize, dimension: usize, max_init_steps: u32) -> Self {
        Self {
            agent_id,
            rank,
            dimension,
            max_init_steps,
            init_steps: 0,
            lifting: None,
            anchor: None,
        }
    }

    /// True on the root agent
    pub fn is_root(&self) -> bool {
        self.agent_id == ROOT_AGENT
    }

    fn check_shape(&self, matrix: &Matrix) -> CoordinationResult<()> {
        if matrix.rows() != self.rank || matrix.cols() != self.dimension {
            return Err(CoordinationError::LiftingMatrixShape {
                rows: matrix.rows(),
                cols: matrix.cols(),
                rank: self.rank,
                dimension: self.dimension,
            });
        }
        Ok(())
    }

    /// Install the root's own matrix
    pub fn install_canonical(&mut self, matrix: Matrix) -> CoordinationResult<()> {
        self.check_shape(&matrix)?;
        let digest = matrix.digest();
        info!(agent = self.agent_id, digest = %digest, "lifting matrix installed");
        self.lifting = Some((matrix, digest));
        Ok(())
    }

    /// Request this agent sends to the root
    pub fn request(&self) -> LiftingMatrixRequest {
        LiftingMatrixRequest {
            requester: self.agent_id,
            robot_id: ROOT_AGENT,
        }
    }

    /// Root side of the bootstrap query
    pub fn answer(&self, request: &LiftingMatrixRequest) -> CoordinationResult<LiftingMatrixResponse> {
        if !self.is_root() || request.robot_id != self.agent_id {
            return Err(CoordinationError::BootstrapRefused(format!(
                "agent {} does not own the lifting matrix (asked for {})",
                self.agent_id, request.robot_id
            )));
        }
        let (matrix, digest) = self
            .lifting
            .as_ref()
            .ok_or(CoordinationError::LiftingMatrixUnavailable(self.agent_id))?;
        debug!(agent = self.agent_id, requester = request.requester, "answering lifting matrix query");
        Ok(LiftingMatrixResponse {
            matrix: matrix.clone(),
            digest: digest.clone(),
        })
    }

    /// Requester side: verify digest and shape of the root's answer, then install it
    pub fn accept_response(&mut self, response: LiftingMatrixResponse) -> CoordinationResult<&Matrix> {
        let got = response.matrix.digest();
        if got != response.digest {
            return Err(CoordinationError::LiftingMatrixMismatch {
                expected: response.digest,
                got,
            });
        }
        self.check_shape(&response.matrix)?;
        info!(agent = self.agent_id, digest = %got, "lifting matrix received from root");
        let (matrix, _) = self.lifting.insert((response.matrix, got));
        Ok(matrix)
    }

    /// Handle the root's lifting matrix broadcast.
    ///
    /// A held copy that disagrees with the root is replaced by the root's.
    pub fn on_broadcast(&mut self, msg: &LiftingMatrixMsg) -> CoordinationResult<LiftingSync> {
        if msg.owner != ROOT_AGENT || self.is_root() {
            return Ok(LiftingSync::Unchanged);
        }
        let got = msg.matrix.digest();
        if got != msg.digest {
            return Err(CoordinationError::LiftingMatrixMismatch {
                expected: msg.digest.clone(),
                got,
            });
        }
        if matches!(&self.lifting, Some((_, held)) if *held == got) {
            return Ok(LiftingSync::Unchanged);
        }
        self.check_shape(&msg.matrix)?;
        let previous = self.lifting.replace((msg.matrix.clone(), got.clone()));
        match previous {
            Some((_, held)) => {
                warn!(agent = self.agent_id, held = %held, root = %got, "lifting matrix diverged from root, replaced");
                Ok(LiftingSync::Replaced {
                    held,
                    matrix: msg.matrix.clone(),
                })
            }
            None => {
                info!(agent = self.agent_id, digest = %got, "adopted broadcast lifting matrix");
                Ok(LiftingSync::Adopted(msg.matrix.clone()))
            }
        }
    }

    /// Broadcast payload of the root's matrix
    pub fn broadcast(&self) -> Option<LiftingMatrixMsg> {
        if !self.is_root() {
            return None;
        }
        self.lifting.as_ref().map(|(matrix, digest)| LiftingMatrixMsg {
            owner: self.agent_id,
            matrix: matrix.clone(),
            digest: digest.clone(),
        })
    }

    /// Held lifting matrix
    pub fn lifting_matrix(&self) -> Option<&Matrix> {
        self.lifting.as_ref().map(|(m, _)| m)
    }

    /// Digest of the held lifting matrix
    pub fn lifting_digest(&self) -> Option<&str> {
        self.lifting.as_ref().map(|(_, d)| d.as_str())
    }

    /// Count one readiness broadcast; fails once the budget is spent
    pub fn record_init_attempt(&mut self) -> CoordinationResult<u32> {
        if self.init_steps >= self.max_init_steps {
            return Err(CoordinationError::InitializationExhausted {
                attempts: self.init_steps,
            });
        }
        self.init_steps += 1;
        Ok(self.init_steps)
    }

    /// Readiness broadcasts made so far
    pub fn init_attempts(&self) -> u32 {
        self.init_steps
    }

    /// Restart the handshake budget
    pub fn reset_init(&mut self) {
        self.init_steps = 0;
    }

    /// Cache the root's anchor; older anchors are ignored
    pub fn on_anchor(&mut self, anchor: Anchor) -> bool {
        if anchor.owner != ROOT_AGENT {
            return false;
        }
        if let Some(held) = &self.anchor {
            if held.iteration > anchor.iteration {
                return false;
            }
        }
        self.anchor = Some(anchor);
        true
    }

    /// Latest anchor
    pub fn anchor(&self) -> Option<&Anchor> {
        self.anchor.as_ref()
    }

    /// Latest anchor pose, or `AnchorUnavailable`
    pub fn require_anchor(&self) -> CoordinationResult<&Pose> {
        self.anchor
            .as_ref()
            .map(|a| &a.pose)
            .ok_or(CoordinationError::AnchorUnavailable)
    }

    /// Forget the lifting matrix copy, the anchor and the handshake count
    pub fn reset(&mut self) {
        self.lifting = None;
        self.anchor = None;
        self.init_steps = 0;
    }
}
