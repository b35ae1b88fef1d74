//! In-process message bus
//!
//! A tokio broadcast channel stands in for the best-effort broadcast topics,
//! and an mpsc channel carrying oneshot reply senders serves the one blocking
//! exchange, the bootstrap lifting-matrix query. A deterministic loss filter
//! lets tests drop chosen messages.

use crate::error::{CoordinationError, CoordinationResult};
use crate::messages::{BusMessage, LiftingMatrixRequest, LiftingMatrixResponse};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error};

/// Default broadcast capacity (messages)
pub const DEFAULT_BUS_CAPACITY: usize = 4096;

/// Pending bootstrap queries the root may hold
const QUERY_CAPACITY: usize = 64;

/// Reply half of a bootstrap query
pub type LiftingReply = oneshot::Sender<CoordinationResult<LiftingMatrixResponse>>;

/// Bootstrap query as delivered to the root
#[derive(Debug)]
pub struct LiftingQuery {
    /// Query
    pub request: LiftingMatrixRequest,
    /// Where the answer goes
    pub reply: LiftingReply,
}

/// Decides whether a published message is lost
pub type LossFilter = Arc<dyn Fn(&BusMessage) -> bool + Send + Sync>;

/// Cloneable handle to the shared bus
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<BusMessage>,
    query_tx: mpsc::Sender<LiftingQuery>,
    loss: Option<LossFilter>,
}

impl fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBus")
            .field("subscribers", &self.tx.receiver_count())
            .field("lossy", &self.loss.is_some())
            .finish()
    }
}

impl LocalBus {
    /// Create a bus; the returned receiver belongs to the root's runtime
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LiftingQuery>) {
        let (tx, _) = broadcast::channel(capacity);
        let (query_tx, query_rx) = mpsc::channel(QUERY_CAPACITY);
        debug!(capacity, "LocalBus::new");
        (
            Self {
                tx,
                query_tx,
                loss: None,
            },
            query_rx,
        )
    }

    /// Bus with the default capacity
    pub fn with_default_capacity() -> (Self, mpsc::Receiver<LiftingQuery>) {
        Self::new(DEFAULT_BUS_CAPACITY)
    }

    /// Drop every message for which `filter` returns true
    pub fn with_loss(mut self, filter: impl Fn(&BusMessage) -> bool + Send + Sync + 'static) -> Self {
        self.loss = Some(Arc::new(filter));
        self
    }

    /// Broadcast a message. Best effort: lost or unheard messages are not errors.
    pub fn publish(&self, msg: BusMessage) {
        if let Some(loss) = &self.loss {
            if loss(&msg) {
                debug!(kind = msg.kind_name(), publisher = msg.publisher(), "message lost");
                return;
            }
        }
        let _ = self.tx.send(msg);
    }

    /// Receive every message published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Ask the root for its lifting matrix and wait at most `timeout`
    pub async fn query_lifting_matrix(
        &self,
        request: LiftingMatrixRequest,
        timeout: Duration,
    ) -> CoordinationResult<LiftingMatrixResponse> {
        let root = request.robot_id;
        let requester = request.requester;
        debug!(agent = requester, root, ?timeout, "querying lifting matrix");
        let exchange = async {
            let (reply, reply_rx) = oneshot::channel();
            self.query_tx
                .send(LiftingQuery { request, reply })
                .await
                .map_err(|_| CoordinationError::BootstrapRefused("query channel closed".into()))?;
            reply_rx
                .await
                .map_err(|_| CoordinationError::BootstrapRefused("root dropped the query".into()))?
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                error!(agent = requester, root, ?timeout, "lifting matrix query timed out");
                Err(CoordinationError::BootstrapTimeout {
                    root,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}
