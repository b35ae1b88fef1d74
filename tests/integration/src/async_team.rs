//! Full team runs over the in-process bus, one tokio task per agent.

use crate::test_utils::*;
use dpgo_coordination::{Agent, AgentRuntime, AgentState, CoordinationResult, LiftingQuery, LocalBus};
use dpgo_core::{AgentConfig, AgentId, RelativeMeasurement, ROOT_AGENT};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

fn fast_config(num_robots: usize) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.optimizer.num_robots = num_robots;
    config.optimizer.max_iterations = 300;
    config.tick_interval = 0.01;
    config.root_settle_delay = 0.2;
    config.bootstrap_timeout = 2.0;
    config
}

type AgentHandle = JoinHandle<CoordinationResult<Agent<SimOptimizer>>>;

fn spawn_team(
    config: &AgentConfig,
    bus: LocalBus,
    root_queries: mpsc::Receiver<LiftingQuery>,
    graphs: Vec<Vec<RelativeMeasurement>>,
) -> Vec<AgentHandle> {
    let mut root_queries = Some(root_queries);
    // Subscribe every agent before any of them publishes
    let mut runtimes = Vec::with_capacity(graphs.len());
    for (id, edges) in graphs.into_iter().enumerate() {
        let mut agent = Agent::new(id as AgentId, config.clone(), SimOptimizer::default()).unwrap();
        agent.stage_pose_graph(edges);
        let mut runtime = AgentRuntime::new(agent, bus.clone());
        if id as AgentId == ROOT_AGENT {
            if let Some(queries) = root_queries.take() {
                runtime = runtime.with_query_receiver(queries);
            }
        }
        runtimes.push(runtime);
    }
    runtimes.into_iter().map(|r| tokio::spawn(r.run())).collect()
}

async fn join_all(handles: Vec<AgentHandle>) -> Vec<Agent<SimOptimizer>> {
    let mut agents = Vec::with_capacity(handles.len());
    for handle in handles {
        let agent = tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .expect("agent finished in time")
            .expect("agent task did not panic")
            .expect("agent ran without fatal errors");
        agents.push(agent);
    }
    agents
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_team_runs_to_termination_over_bus() {
    init_test_logging();
    let config = fast_config(3);
    let (bus, queries) = LocalBus::with_default_capacity();
    let handles = spawn_team(&config, bus, queries, chain_team_graph(3, 5, false));

    let agents = join_all(handles).await;
    let root_matrix = agents[0].lifting_matrix().cloned().unwrap();
    for agent in &agents {
        assert_eq!(agent.state(), AgentState::Terminated);
        assert!(agent.iteration() > 0, "agent {} never stepped", agent.id());
        assert!(agent.lifting_matrix().unwrap().bit_identical(&root_matrix));
        assert!(agent.trajectory().is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_robust_team_over_bus() {
    let mut config = fast_config(3);
    config.optimizer.robust_weighting = true;
    config.optimizer.robust_opt_inner_iters = 4;
    let (bus, queries) = LocalBus::with_default_capacity();
    let handles = spawn_team(&config, bus, queries, chain_team_graph(3, 4, true));

    let agents = join_all(handles).await;
    assert!(agents[0].weights_converged());
    for key in chain_outlier_edges(3, 4) {
        assert_eq!(agents[key.r1 as usize].weights().get(&key), Some(0.0));
        assert_eq!(agents[key.r2 as usize].weights().get(&key), Some(0.0));
    }
}

#[tokio::test]
async fn test_team_stops_on_shutdown() {
    let mut config = fast_config(2);
    // Root stays in its settle delay for the whole test
    config.root_settle_delay = 60.0;
    let (bus, queries) = LocalBus::with_default_capacity();
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut root = Agent::new(ROOT_AGENT, config, SimOptimizer::default()).unwrap();
    root.stage_pose_graph(chain_team_graph(2, 3, false).remove(0));
    let handle = tokio::spawn(
        AgentRuntime::new(root, bus)
            .with_query_receiver(queries)
            .with_shutdown(stop_rx)
            .run(),
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    stop_tx.send(true).unwrap();
    let root = handle.await.unwrap().unwrap();
    assert_eq!(root.state(), AgentState::PoseGraphLoaded);
    assert_eq!(root.iteration(), 0);
}
