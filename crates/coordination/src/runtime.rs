//! Async dispatch loop for one agent
//!
//! Runs the bootstrap query, then reacts to bus messages, bootstrap queries
//! (root only) and a periodic tick. Handlers never run concurrently; after each
//! event the agent's outbox is published on the bus.

use crate::agent::Agent;
use crate::bus::{LiftingQuery, LocalBus};
use crate::error::{CoordinationError, CoordinationResult};
use crate::messages::{AgentState, BusMessage};
use crate::optimizer::Optimizer;
use dpgo_core::AgentId;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

enum Event {
    Message(Result<BusMessage, RecvError>),
    Query(LiftingQuery),
    Tick,
    Shutdown,
}

/// Event loop driving one [`Agent`]
pub struct AgentRuntime<O: Optimizer> {
    agent: Agent<O>,
    bus: LocalBus,
    inbox: broadcast::Receiver<BusMessage>,
    queries: Option<mpsc::Receiver<LiftingQuery>>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<O: Optimizer + 'static> AgentRuntime<O> {
    /// Runtime for `agent`; subscribes to the bus immediately
    pub fn new(agent: Agent<O>, bus: LocalBus) -> Self {
        let inbox = bus.subscribe();
        Self {
            agent,
            bus,
            inbox,
            queries: None,
            shutdown: None,
        }
    }

    /// Serve bootstrap queries (root only)
    pub fn with_query_receiver(mut self, queries: mpsc::Receiver<LiftingQuery>) -> Self {
        self.queries = Some(queries);
        self
    }

    /// Stop when `shutdown` turns true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Run until the agent is terminal or shutdown is signalled.
    ///
    /// Returns the agent for inspection. Only fatal errors end the run early.
    pub async fn run(mut self) -> CoordinationResult<Agent<O>> {
        let id = self.agent.id();
        info!(agent = id, "agent runtime starting");
        if self.agent.needs_bootstrap() {
            self.bootstrap().await?;
        }

        let mut ticker = tokio::time::interval(self.agent.config().tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.agent.is_terminal() {
            let event = tokio::select! {
                received = self.inbox.recv() => Event::Message(received),
                Some(query) = next_query(&mut self.queries) => Event::Query(query),
                _ = ticker.tick() => Event::Tick,
                _ = shutdown_signal(&mut self.shutdown) => Event::Shutdown,
            };

            let now = tokio::time::Instant::now().into_std();
            let result = match event {
                Event::Message(Ok(msg)) => self.agent.handle_message(msg, now),
                Event::Message(Err(RecvError::Lagged(skipped))) => {
                    warn!(agent = id, skipped, "bus receiver lagged, messages lost");
                    Ok(())
                }
                Event::Message(Err(RecvError::Closed)) => Err(CoordinationError::BusClosed),
                Event::Query(query) => {
                    let answer = self.agent.answer_lifting_query(&query.request);
                    if let Err(e) = &answer {
                        warn!(agent = id, requester = query.request.requester, error = %e, "lifting matrix query refused");
                    }
                    let _ = query.reply.send(answer);
                    Ok(())
                }
                Event::Tick => self.agent.tick(now),
                Event::Shutdown => {
                    info!(agent = id, "shutdown requested");
                    break;
                }
            };

            for msg in self.agent.drain_outbox() {
                self.bus.publish(msg);
            }
            settle(id, result)?;

            if self.agent.state() == AgentState::Idle && self.agent.needs_bootstrap() {
                self.bootstrap().await?;
            }
        }

        info!(agent = id, state = %self.agent.state(), iteration = self.agent.iteration(), "agent runtime stopped");
        Ok(self.agent)
    }

    async fn bootstrap(&mut self) -> CoordinationResult<()> {
        let request = self.agent.lifting_request();
        let timeout = self.agent.config().bootstrap_query_timeout();
        let response = self.bus.query_lifting_matrix(request, timeout).await?;
        self.agent
            .accept_lifting_matrix(response)
            .map_err(|e| CoordinationError::BootstrapRefused(e.to_string()))
    }
}

/// Log recoverable failures; pass fatal ones up
fn settle(id: AgentId, result: CoordinationResult<()>) -> CoordinationResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => {
            error!(agent = id, error = %e, "fatal coordination error");
            Err(e)
        }
        Err(e) => {
            warn!(agent = id, error = %e, "handler failed");
            Ok(())
        }
    }
}

async fn next_query(queries: &mut Option<mpsc::Receiver<LiftingQuery>>) -> Option<LiftingQuery> {
    match queries {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn shutdown_signal(shutdown: &mut Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(rx) => {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
        None => std::future::pending().await,
    }
}
