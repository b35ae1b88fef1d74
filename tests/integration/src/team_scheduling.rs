//! Team-level scheduling
//!
//! # Test Scenarios
//!
//! 1. **Round robin**: a three-robot team steps in the order 0, 1, 2, 0, ...
//! 2. **Single executor**: every epoch is executed by exactly one agent, even
//!    when every message is delivered twice
//! 3. **Uniform rule**: the token never stays with the agent that just stepped
//! 4. **Bootstrap consistency**: every agent holds the root's lifting matrix bit for bit

use crate::test_utils::*;
use dpgo_coordination::{AgentState, CommandKind};
use dpgo_core::{UpdateRule, ROOT_AGENT};
use std::collections::BTreeSet;

#[test]
fn test_round_robin_team_run() {
    init_test_logging();
    let mut team = SyncTeam::new(team_config(3), chain_team_graph(3, 4, false));

    assert!(team.run_until(2_000, SyncTeam::all_terminated));

    let executors = team.executors();
    assert!(executors.len() >= 30, "every agent needs ten steps to settle");
    assert_eq!(&executors[..9], &[0, 1, 2, 0, 1, 2, 0, 1, 2]);

    // Convergence, not the iteration cap, ended the run
    let root = team.agent(ROOT_AGENT);
    assert!(root.epoch() < root.config().optimizer.max_iterations);

    for agent in team.agents() {
        assert_eq!(agent.state(), AgentState::Terminated);
        assert!(agent.trajectory().is_some(), "agent {} has no final trajectory", agent.id());
    }
    assert!(!team.commands().iter().any(|c| c.kind == CommandKind::UpdateWeight));
}

#[test]
fn test_epochs_are_executed_once() {
    let mut team = SyncTeam::new(team_config(3), chain_team_graph(3, 4, false));
    assert!(team.run_until(2_000, SyncTeam::all_terminated));

    let epochs: Vec<u64> = team.iterations().iter().map(|r| r.epoch).collect();
    let expected: Vec<u64> = (1..=epochs.len() as u64).collect();
    assert_eq!(epochs, expected);

    for agent in team.agents() {
        assert_eq!(agent.iteration(), logged_steps(&team, agent.id()).len() as u64);
    }
}

#[test]
fn test_duplicate_delivery_keeps_single_executor() {
    let mut team = SyncTeam::new(team_config(3), chain_team_graph(3, 4, false));
    team.set_duplicate(true);
    assert!(team.run_until(2_000, SyncTeam::all_terminated));

    let records = team.iterations();
    let unique: BTreeSet<u64> = records.iter().map(|r| r.epoch).collect();
    assert_eq!(unique.len(), records.len());
    assert_eq!(team.executors()[..6], [0, 1, 2, 0, 1, 2]);
}

#[test]
fn test_uniform_rule_never_repeats_executor() {
    let mut config = team_config(3);
    config.update_rule = UpdateRule::Uniform;
    config.optimizer.max_iterations = 40;
    // Only the iteration cap ends this run
    config.optimizer.relative_change_tolerance = 0.0;
    let mut team = SyncTeam::new(config, chain_team_graph(3, 4, false));

    assert!(team.run_until(2_000, SyncTeam::all_terminated));

    let executors = team.executors();
    assert!(executors.len() >= 40);
    assert!(executors.windows(2).all(|w| w[0] != w[1]));
    let distinct: BTreeSet<_> = executors.iter().copied().collect();
    assert_eq!(distinct.len(), 3);
}

#[test]
fn test_bootstrap_consistency() {
    let mut team = SyncTeam::new(team_config(4), chain_team_graph(4, 3, false));
    let root_matrix = team.agent(ROOT_AGENT).lifting_matrix().cloned().unwrap();
    assert_eq!((root_matrix.rows(), root_matrix.cols()), (5, 3));

    for agent in team.agents() {
        let held = agent.lifting_matrix().unwrap();
        assert!(held.bit_identical(&root_matrix), "agent {} diverged", agent.id());
    }

    let running = team.run_until(200, |t| t.agents().iter().all(|a| a.state().is_running()));
    assert!(running);
    for agent in team.agents() {
        let installed = agent.optimizer().lifting.as_ref().unwrap();
        assert_eq!(installed.digest(), root_matrix.digest());
    }
    // No agent reported a digest the root disagrees with
    assert!(!team.errors().iter().any(|e| e.contains("Lifting matrix inconsistent")));
}

#[test]
fn test_commands_carry_wire_names() {
    let mut team = SyncTeam::new(team_config(2), chain_team_graph(2, 3, false));
    assert!(team.run_until(200, |t| t.agent(1).iteration() >= 1));

    let update = team
        .commands()
        .iter()
        .find(|c| c.kind == CommandKind::Update && c.executing_agent == 1)
        .unwrap();
    let json = command_json(update);
    assert_eq!(json["kind"], "UPDATE");
    assert_eq!(json["publishing_agent"], 0);
}
