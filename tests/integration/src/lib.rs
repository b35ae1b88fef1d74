//! Multi-agent integration tests for the DPGO coordination layer
//!
//! This test suite validates:
//! - Single-executor scheduling across a team
//! - Bounded staleness under lossy pose exchange
//! - Peer exclusion and root recovery after a timeout
//! - Bootstrap consistency of the lifting matrix
//! - Robust weight rounds and team convergence
//! - Reset and restart of a whole team
//! - A full team run over the async in-process bus

pub mod test_utils;

#[cfg(test)]
mod team_scheduling;

#[cfg(test)]
mod fault_tolerance;

#[cfg(test)]
mod weight_rounds;

#[cfg(test)]
mod async_team;
