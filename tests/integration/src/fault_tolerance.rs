//! Fault tolerance of a running team
//!
//! # Test Scenarios
//!
//! 1. **Silent agent**: a peer that stops talking is excluded by the root and
//!    the rest of the team keeps stepping
//! 2. **Lost UPDATE**: the root re-issues a token that never reached its executor
//! 3. **Lost public poses**: updates proceed on stale data after bounded deferral
//! 4. **Lossy heartbeats**: random status loss does not break a run
//! 5. **Complete reset**: a terminated team returns to IDLE and runs again
//! 6. **Truncated public poses**: a short batch never satisfies the barrier
//! 7. **Diverged lifting matrix**: the root's copy overwrites a peer's
//! 8. **Mismatched digest**: the root never acknowledges such a peer
//! 9. **Unreachable token holder**: a peer's report makes the root re-elect

use crate::test_utils::*;
use dpgo_coordination::{AgentState, BusMessage, CommandKind, LiftingMatrixResponse};
use dpgo_core::{AgentId, ROOT_AGENT};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;

fn ids(set: BTreeSet<AgentId>) -> Vec<AgentId> {
    set.into_iter().collect()
}

#[test]
fn test_silent_agent_excluded_by_root() {
    init_test_logging();
    let mut config = team_config(3);
    config.timeout_threshold = 1.0;
    config.optimizer.max_iterations = 60;
    config.optimizer.relative_change_tolerance = 0.0;
    let mut team = SyncTeam::new(config, chain_team_graph(3, 4, false));

    assert!(team.run_until(500, |t| t.agent(ROOT_AGENT).epoch() >= 6));
    let frozen = team.agent(2).iteration();
    team.set_offline(2);

    assert!(team.run_until(3_000, |t| t.agent(0).is_terminal() && t.agent(1).is_terminal()));

    assert_eq!(ids(team.agent(0).active_set()), vec![0, 1]);
    assert_eq!(ids(team.agent(1).active_set()), vec![0, 1]);
    assert_eq!(team.agent(2).iteration(), frozen);
    assert_eq!(team.agent(2).state(), AgentState::Optimizing);

    // The survivors ran the remaining epochs between themselves
    let survivors: BTreeSet<_> = team
        .iterations()
        .iter()
        .filter(|r| r.epoch > 12)
        .map(|r| r.agent_id)
        .collect();
    assert_eq!(ids(survivors), vec![0, 1]);
    assert!(team.agent(ROOT_AGENT).epoch() >= 60);

    let excluded = team.commands().iter().any(|c| {
        c.kind == CommandKind::ActiveRobots && c.publishing_agent == ROOT_AGENT && c.active_robots == vec![0, 1]
    });
    assert!(excluded);
}

#[test]
fn test_root_recovers_lost_update() {
    let mut config = team_config(3);
    config.timeout_threshold = 1.0;
    let mut team = SyncTeam::new(config, chain_team_graph(3, 4, false));
    team.set_drop_filter(|msg, _| {
        matches!(msg, BusMessage::Command(c) if c.kind == CommandKind::Update && c.epoch == 2)
    });

    assert!(team.run_until(2_000, SyncTeam::all_terminated));

    let records = team.iterations();
    assert_eq!(records[0].epoch, 1);
    assert_eq!(records[0].agent_id, 0);
    // Nobody ran epoch 2; the root's recovery token went past the lost executor
    assert_eq!(records[1].epoch, 3);
    assert_eq!(records[1].agent_id, 2);

    let recovery = team
        .commands()
        .iter()
        .find(|c| c.kind == CommandKind::Update && c.epoch == 3)
        .unwrap();
    assert_eq!(recovery.publishing_agent, ROOT_AGENT);
    assert!(team.dropped() > 0);
}

#[test]
fn test_lost_public_poses_proceed_stale() {
    let mut config = team_config(3);
    config.optimizer.max_iterations = 45;
    let mut team = SyncTeam::new(config, chain_team_graph(3, 4, false));
    team.set_drop_filter(|msg, _| matches!(msg, BusMessage::PublicPoses(p) if p.owner == 2));

    assert!(team.run_until(3_000, SyncTeam::all_terminated));

    // Agent 1 is agent 2's only neighbor
    let stale_on_1 = logged_steps(&team, 1).iter().filter(|r| r.stale).count();
    assert!(stale_on_1 > 0);
    assert!(logged_steps(&team, 0).iter().all(|r| !r.stale));
    assert!(!team.agent(1).optimizer().neighbor_updates.contains_key(&2));
    assert!(team.agent(1).optimizer().neighbor_updates[&0] > 0);
}

#[test]
fn test_lossy_heartbeats_do_not_break_run() {
    let mut team = SyncTeam::new(team_config(3), chain_team_graph(3, 4, false));
    let mut rng = StdRng::seed_from_u64(7);
    team.set_drop_filter(move |msg, _| matches!(msg, BusMessage::Status(_)) && rng.gen_bool(0.2));

    assert!(team.run_until(3_000, SyncTeam::all_terminated));
    let records = team.iterations();
    let unique: BTreeSet<u64> = records.iter().map(|r| r.epoch).collect();
    assert_eq!(unique.len(), records.len());
}

#[test]
fn test_complete_reset_restarts_team() {
    let mut config = team_config(3);
    config.complete_reset = true;
    config.optimizer.max_iterations = 6;
    config.optimizer.relative_change_tolerance = 0.0;
    let mut team = SyncTeam::new(config, chain_team_graph(3, 4, false));
    let root_digest = team.agent(ROOT_AGENT).lifting_matrix().unwrap().digest();

    let restarted = team.run_until(1_000, |t| {
        logged_steps(t, ROOT_AGENT).iter().filter(|r| r.epoch == 1).count() >= 2
    });
    assert!(restarted);

    for agent in team.agents() {
        assert!(!agent.is_terminal());
        assert!(agent.optimizer().resets >= 1);
        // Non-root agents bootstrapped again after the reset
        assert_eq!(agent.lifting_matrix().unwrap().digest(), root_digest);
    }
    let runs = team
        .commands()
        .iter()
        .filter(|c| c.kind == CommandKind::Terminate)
        .count();
    assert!(runs >= 1);
}

#[test]
fn test_truncated_public_poses_proceed_stale() {
    let mut config = team_config(3);
    config.optimizer.max_iterations = 45;
    let mut team = SyncTeam::new(config, chain_team_graph(3, 4, true));
    // Agent 1 needs poses 0 and 3 from agent 2; only the first survives
    team.set_rewrite(|msg| {
        if let BusMessage::PublicPoses(p) = msg {
            if p.owner == 2 {
                p.poses.truncate(1);
            }
        }
    });

    assert!(team.run_until(3_000, SyncTeam::all_terminated));

    assert!(logged_steps(&team, 1).iter().any(|r| r.stale));
    assert!(!team.agent(1).optimizer().neighbor_updates.contains_key(&2));
    assert!(team.errors().iter().any(|e| e.starts_with("agent 1") && e.contains("cardinality mismatch")));
}

#[test]
fn test_diverged_lifting_matrix_resynced() {
    let mut team = SyncTeam::new(team_config(3), chain_team_graph(3, 4, false));
    let root_matrix = team.agent(ROOT_AGENT).lifting_matrix().unwrap().clone();
    let mut diverged = root_matrix.clone();
    diverged.set(diverged.rows() - 1, 0, 1.0);
    team.agent_mut(2)
        .accept_lifting_matrix(LiftingMatrixResponse {
            digest: diverged.digest(),
            matrix: diverged,
        })
        .unwrap();

    assert!(team.run_until(2_000, SyncTeam::all_terminated));

    for agent in team.agents() {
        assert!(agent.lifting_matrix().unwrap().bit_identical(&root_matrix), "agent {} diverged", agent.id());
        assert!(agent.optimizer().lifting.as_ref().unwrap().bit_identical(&root_matrix));
    }
    assert!(team.errors().iter().any(|e| e.starts_with("agent 2") && e.contains("Lifting matrix inconsistent")));
    assert!(team.agent(2).iteration() > 0);
}

#[test]
fn test_mismatched_digest_never_acknowledged() {
    let mut team = SyncTeam::new(team_config(3), chain_team_graph(3, 4, false));
    team.set_rewrite(|msg| {
        if let BusMessage::Status(s) = msg {
            if s.agent_id == 2 && s.lifting_digest.is_some() {
                s.lifting_digest = Some("0000".to_owned());
            }
        }
    });

    assert!(team.run_until(200, |t| t.agent(2).is_terminal()));

    let acks: BTreeSet<AgentId> = team
        .commands()
        .iter()
        .filter(|c| c.kind == CommandKind::Initialize)
        .map(|c| c.executing_agent)
        .collect();
    assert_eq!(ids(acks), vec![1]);
    assert_eq!(team.agent(1).state(), AgentState::Optimizing);
    assert_eq!(team.agent(2).iteration(), 0);
    assert!(team.errors().iter().any(|e| e.starts_with("agent 0") && e.contains("Lifting matrix inconsistent")));
}

#[test]
fn test_root_reelects_around_unreachable_holder() {
    let mut config = team_config(3);
    config.inter_update_sleep_time = 0.25;
    let mut team = SyncTeam::new(config, chain_team_graph(3, 4, false));
    // Agent 2 never hears agent 1
    team.set_drop_filter(|msg, receiver| receiver == 2 && matches!(msg, BusMessage::Status(s) if s.agent_id == 1));

    assert!(team.run_until(3_000, SyncTeam::all_terminated));

    let reelected = team.commands().iter().any(|c| {
        c.kind == CommandKind::Update && c.publishing_agent == ROOT_AGENT && c.executing_agent == 2 && c.epoch > 1
    });
    assert!(reelected);
    assert_eq!(ids(team.agent(ROOT_AGENT).active_set()), vec![0, 1, 2]);

    let records = team.iterations();
    let unique: BTreeSet<u64> = records.iter().map(|r| r.epoch).collect();
    assert_eq!(unique.len(), records.len());
    assert!(!logged_steps(&team, 1).is_empty());
}
