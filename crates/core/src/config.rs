//! Configuration for DPGO agents.
//!
//! `AgentConfig` wraps the optimizer's own `OptimizerConfig` instead of extending it,
//! and adds the coordination-layer options on top.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Policy used to pick the next executing agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum UpdateRule {
    /// Independent uniform draw every round
    Uniform,
    /// Deterministic cyclic order over the active set
    #[default]
    RoundRobin,
}

/// Settings consumed by the local optimization routine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Pose dimension `d` (2 or 3)
    pub dimension: usize,
    /// Relaxation rank `r` (>= d)
    pub relaxation_rank: usize,
    /// Number of robots in the team
    pub num_robots: usize,
    /// Hard cap on global iterations (command epochs)
    pub max_iterations: u64,
    /// Relative cost change under which an agent reports it is ready to terminate
    pub relative_change_tolerance: f64,
    /// Enable robust weighting of shared loop closures
    pub robust_weighting: bool,
    /// UPDATE rounds between two weight rounds
    pub robust_opt_inner_iters: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            dimension: 3,
            relaxation_rank: 5,
            num_robots: 1,
            max_iterations: 1000,
            relative_change_tolerance: 1e-3,
            robust_weighting: false,
            robust_opt_inner_iters: 10,
        }
    }
}

/// Coordination-layer configuration for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Optimizer settings
    pub optimizer: OptimizerConfig,
    /// Scheduling policy
    pub update_rule: UpdateRule,
    /// Recompute the global-frame trajectory after every local step
    pub publish_iterate: bool,
    /// Return to IDLE after termination instead of staying terminal
    pub complete_reset: bool,
    /// Readiness handshakes attempted before initialization is declared failed
    pub max_distributed_init_steps: u32,
    /// Scheduling rounds an update may wait on a stale neighbor
    pub max_delayed_iterations: u32,
    /// Weight change under which weights count as converged
    pub weight_convergence_threshold: f64,
    /// Delay before handing the update token to the next agent (seconds)
    pub inter_update_sleep_time: f64,
    /// Silence after which a peer is treated as unreachable (seconds)
    pub timeout_threshold: f64,
    /// Period of the dispatch tick (seconds)
    pub tick_interval: f64,
    /// Delay between the root loading its graph and requesting the team's (seconds)
    pub root_settle_delay: f64,
    /// Timeout of the bootstrap lifting-matrix query (seconds)
    pub bootstrap_timeout: f64,
    /// Directory for the persisted iteration logs
    pub log_directory: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimizerConfig::default(),
            update_rule: UpdateRule::RoundRobin,
            publish_iterate: false,
            complete_reset: false,
            max_distributed_init_steps: 30,
            max_delayed_iterations: 3,
            weight_convergence_threshold: 1e-6,
            inter_update_sleep_time: 0.0,
            timeout_threshold: 15.0,
            tick_interval: 0.1,
            root_settle_delay: 3.0,
            bootstrap_timeout: 5.0,
            log_directory: None,
        }
    }
}

impl AgentConfig {
    /// Load and validate a TOML config file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the coordination layer cannot run with
    pub fn validate(&self) -> Result<()> {
        let opt = &self.optimizer;
        if opt.dimension == 0 {
            return Err(CoreError::InvalidConfig("dimension must be positive".into()));
        }
        if opt.relaxation_rank < opt.dimension {
            return Err(CoreError::InvalidConfig(format!(
                "relaxation_rank {} is below dimension {}",
                opt.relaxation_rank, opt.dimension
            )));
        }
        if opt.num_robots == 0 {
            return Err(CoreError::InvalidConfig("num_robots must be positive".into()));
        }
        if opt.robust_weighting && opt.robust_opt_inner_iters == 0 {
            return Err(CoreError::InvalidConfig(
                "robust_opt_inner_iters must be positive when robust weighting is on".into(),
            ));
        }
        if !(self.weight_convergence_threshold > 0.0) {
            return Err(CoreError::InvalidConfig(
                "weight_convergence_threshold must be positive".into(),
            ));
        }
        for (name, secs) in [
            ("inter_update_sleep_time", self.inter_update_sleep_time),
            ("timeout_threshold", self.timeout_threshold),
            ("tick_interval", self.tick_interval),
            ("root_settle_delay", self.root_settle_delay),
            ("bootstrap_timeout", self.bootstrap_timeout),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                return Err(CoreError::InvalidConfig(format!(
                    "{name} must be a non-negative number of seconds, got {secs}"
                )));
            }
        }
        if self.tick_interval == 0.0 {
            return Err(CoreError::InvalidConfig("tick_interval must be positive".into()));
        }
        Ok(())
    }

    /// Handoff throttle
    pub fn inter_update_sleep(&self) -> Duration {
        Duration::from_secs_f64(self.inter_update_sleep_time)
    }

    /// Peer silence tolerance
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_threshold)
    }

    /// Dispatch tick period
    pub fn tick(&self) -> Duration {
        Duration::from_secs_f64(self.tick_interval)
    }

    /// Root settle delay
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs_f64(self.root_settle_delay)
    }

    /// Bootstrap query timeout
    pub fn bootstrap_query_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.bootstrap_timeout)
    }

    /// Persisted log path for `agent_id`, if a log directory is configured
    pub fn log_path(&self, agent_id: u32) -> Option<PathBuf> {
        self.log_directory
            .as_ref()
            .map(|dir| dir.join(format!("dpgo_agent_{agent_id}.db")))
    }
}
