//! Runs a whole DPGO team in one process on the in-process bus.
//!
//! ```text
//! dpgo-node --config team.toml [--json-logs]
//! dpgo-node --version-json
//! ```

mod toy;

use anyhow::{bail, Context, Result};
use dpgo_coordination::{Agent, AgentRuntime, LocalBus};
use dpgo_core::{logging, AgentConfig, AgentId, ROOT_AGENT};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::watch;
use toy::ToyOptimizer;
use tracing::{info, warn};

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;

/// Poses each simulated robot contributes
const POSES_PER_ROBOT: u32 = 10;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

#[derive(Debug, Serialize)]
struct AgentSummary {
    agent: AgentId,
    state: String,
    iteration: u64,
    epoch: u64,
    weights_converged: bool,
    neighbor_poses: usize,
    trajectory_poses: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    if args.iter().any(|arg| arg == "--json-logs") {
        logging::init_json();
    } else {
        logging::init();
    }

    let config_path = parse_config_path(&args)?;
    let config = AgentConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let num_robots = config.optimizer.num_robots;
    info!(
        robots = num_robots,
        rule = ?config.update_rule,
        robust = config.optimizer.robust_weighting,
        "starting in-process team"
    );

    let (bus, queries) = LocalBus::with_default_capacity();
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut queries = Some(queries);

    // Every runtime subscribes before the first one is spawned
    let mut runtimes = Vec::with_capacity(num_robots);
    for (id, edges) in toy::team_graph(num_robots, POSES_PER_ROBOT).into_iter().enumerate() {
        let mut agent = Agent::new(id as AgentId, config.clone(), ToyOptimizer::default())?;
        agent.stage_pose_graph(edges);
        let mut runtime = AgentRuntime::new(agent, bus.clone()).with_shutdown(stop_rx.clone());
        if id as AgentId == ROOT_AGENT {
            if let Some(queries) = queries.take() {
                runtime = runtime.with_query_receiver(queries);
            }
        }
        runtimes.push(runtime);
    }
    let handles: Vec<_> = runtimes.into_iter().map(|r| tokio::spawn(r.run())).collect();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping team");
            let _ = stop_tx.send(true);
        }
    });

    let mut summaries = Vec::with_capacity(handles.len());
    for handle in handles {
        let agent = handle.await.context("agent task panicked")??;
        info!(
            agent = agent.id(),
            state = %agent.state(),
            iteration = agent.iteration(),
            epoch = agent.epoch(),
            "agent finished"
        );
        summaries.push(summarize(&agent));
    }

    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

fn summarize(agent: &Agent<ToyOptimizer>) -> AgentSummary {
    let d = agent.config().optimizer.dimension;
    AgentSummary {
        agent: agent.id(),
        state: agent.state().to_string(),
        iteration: agent.iteration(),
        epoch: agent.epoch(),
        weights_converged: agent.weights_converged(),
        neighbor_poses: agent.optimizer().neighbor_pose_count(),
        trajectory_poses: agent.trajectory().map(|t| t.cols() / (d + 1)),
    }
}

fn parse_config_path(args: &[String]) -> Result<PathBuf> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(PathBuf::from(path));
            }
            bail!("--config was provided without a path");
        }
    }

    bail!("missing required --config <path> argument")
}
