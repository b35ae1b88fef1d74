//! Core types for the DPGO mesh: agent identifiers, lifted-pose matrices,
//! pose-graph partitions, configuration and logging bootstrap.
//!
//! This crate carries no protocol logic. The coordination layer lives in
//! `dpgo-coordination`.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{AgentConfig, OptimizerConfig, UpdateRule};
pub use error::{CoreError, Result};
pub use types::{
    AgentId, EdgeKey, Matrix, MeasurementKind, Pose, PoseGraphPartition, PoseIndex,
    RelativeMeasurement, ROOT_AGENT,
};
