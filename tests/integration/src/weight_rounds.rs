//! Robust weight rounds across a team
//!
//! Outlier loop closures must end with weight 0 on both endpoints, the team
//! must latch convergence, and only then may the run terminate.

use crate::test_utils::*;
use dpgo_coordination::{AgentState, CommandKind};
use dpgo_core::ROOT_AGENT;

fn robust_config(num_robots: usize) -> dpgo_core::AgentConfig {
    let mut config = team_config(num_robots);
    config.optimizer.robust_weighting = true;
    config.optimizer.robust_opt_inner_iters = 3;
    config
}

#[test]
fn test_outliers_rejected_on_both_endpoints() {
    init_test_logging();
    let mut team = SyncTeam::new(robust_config(3), chain_team_graph(3, 4, true));

    assert!(team.run_until(3_000, SyncTeam::all_terminated));

    for key in chain_outlier_edges(3, 4) {
        for endpoint in [key.r1, key.r2] {
            let agent = team.agent(endpoint);
            assert_eq!(agent.weights().get(&key), Some(0.0), "edge {key:?} on agent {endpoint}");
            assert_eq!(agent.optimizer().shared_weights.get(&key), Some(&0.0));
        }
    }
    for key in chain_inlier_edges(3, 4) {
        assert_eq!(team.agent(key.r1).weights().get(&key), Some(1.0));
        assert_eq!(team.agent(key.r2).weights().get(&key), Some(1.0));
    }

    for agent in team.agents() {
        assert_eq!(agent.state(), AgentState::Terminated);
        assert!(agent.weights_converged(), "agent {} never saw convergence", agent.id());
    }
}

#[test]
fn test_weight_rounds_follow_inner_iterations() {
    let mut team = SyncTeam::new(robust_config(3), chain_team_graph(3, 4, true));
    assert!(team.run_until(3_000, SyncTeam::all_terminated));

    let rounds: Vec<u64> = team
        .commands()
        .iter()
        .filter(|c| c.kind == CommandKind::UpdateWeight)
        .map(|c| c.epoch)
        .collect();
    // One round moves the outliers to 0, the next sees no change
    assert_eq!(rounds, vec![3, 6]);

    // The root closed each round with an UPDATE that continues the epoch sequence
    for round in &rounds {
        let close = team
            .commands()
            .iter()
            .find(|c| c.kind == CommandKind::Update && c.epoch == round + 1)
            .unwrap();
        assert_eq!(close.publishing_agent, ROOT_AGENT);
    }
    let after_close = team
        .commands()
        .iter()
        .filter(|c| c.kind == CommandKind::Update && c.epoch > 7)
        .all(|c| c.weights_converged);
    assert!(after_close);
}

#[test]
fn test_weight_round_logged_by_responsible_agent() {
    let mut team = SyncTeam::new(robust_config(3), chain_team_graph(3, 4, true));
    assert!(team.run_until(3_000, SyncTeam::all_terminated));

    // Agent 0 owns the 0-1 edges, agent 1 the 1-2 edges, agent 2 none
    let root_log = team.agent(0).iteration_log().unwrap();
    let first = root_log.weight_round(3).unwrap();
    assert_eq!(first.len(), 2);
    assert!(first.iter().any(|r| r.p1 == 0 && r.weight_delta == 1.0));
    assert!(first.iter().all(|r| !r.converged));

    let second = root_log.weight_round(6).unwrap();
    assert!(second.iter().all(|r| r.weight_delta == 0.0 && r.converged));

    assert_eq!(team.agent(1).iteration_log().unwrap().weight_round(3).unwrap().len(), 2);
    assert!(team.agent(2).iteration_log().unwrap().weight_round(3).unwrap().is_empty());
}
