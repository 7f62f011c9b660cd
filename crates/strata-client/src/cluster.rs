use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strata_common::protocol::error::{Result, StrataError};
use strata_common::protocol::Message;
use strata_common::transport::{MessageCodec, MessageRegistry};

use crate::client::StrataClient;
use crate::config::{ClusterConfig, RetryConfig};
use crate::connection::Connection;
use crate::health_checker::{HealthChecker, SharedStrategy};
use crate::load_balancer::RoundRobinStrategy;
use crate::node::{Node, NodeLease, NodeState, Outcome};

/// Entry point for every operation against the database.
///
/// Owns the nodes, the load-balancing strategy and one health checker per
/// node. Operations go through [`use_connection`](Self::use_connection):
/// pick a node, run the operation on one of its connections, and on a
/// transport failure try again (usually on another node) until the attempt
/// budget runs out. Errors reported by a node that was reached are returned
/// straight away.
///
/// Cloning is cheap and shares the same nodes. Dropping the last clone
/// without calling [`dispose`](Self::dispose) still stops the health
/// checkers and closes the connections.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

struct ClusterInner {
    nodes: Vec<Arc<Node>>,
    strategy: SharedStrategy,
    retry: RetryConfig,
    codec: MessageCodec,
    health_checkers: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl Cluster {
    /// Starts every configured node and balances across them round-robin.
    pub async fn new(config: ClusterConfig) -> Result<Self> {
        Self::with_strategy(config, Arc::new(RoundRobinStrategy::new())).await
    }

    /// Same as [`new`](Self::new) with a caller-supplied strategy.
    pub async fn with_strategy(config: ClusterConfig, strategy: SharedStrategy) -> Result<Self> {
        let codec = MessageCodec::new(Arc::new(MessageRegistry::standard()), config.codec_format());

        let nodes = config
            .nodes()
            .iter()
            .cloned()
            .map(|node| Node::from_config(node, config.security(), codec.clone()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        for started in futures::future::join_all(nodes.iter().map(|node| node.start())).await {
            started?;
        }

        strategy.initialise(nodes.clone());

        let health_checkers = nodes
            .iter()
            .map(|node| HealthChecker::new(node.clone(), strategy.clone()).spawn())
            .collect();

        info!(nodes = nodes.len(), "cluster started");

        Ok(Self {
            inner: Arc::new(ClusterInner {
                nodes,
                strategy,
                retry: config.retry().clone(),
                codec,
                health_checkers: Mutex::new(health_checkers),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Runs `op` against a connection, making at most `attempts` attempts.
    ///
    /// An attempt fails at the transport level when no node is available,
    /// the node's pool cannot provide a connection in time, or the
    /// connection breaks; the cluster then waits per its [`RetryConfig`] and
    /// tries again. After the last failed attempt the result is
    /// `StrataError::NodeUnreachable` carrying the most recent error.
    /// With `attempts == 0` nothing is tried.
    ///
    /// `op` may run several times, so it should own (or cheaply clone) what
    /// it sends.
    pub async fn use_connection<T, Op>(&self, op: Op, attempts: usize) -> Result<T>
    where
        Op: for<'a> FnMut(&'a mut Connection) -> BoxFuture<'a, Result<T>>,
    {
        self.run_with_retry(op, attempts, None).await
    }

    /// [`use_connection`](Self::use_connection) that gives up with
    /// `StrataError::Cancelled` as soon as `cancel` fires, whether it is
    /// waiting for a connection, talking to a node or waiting to retry.
    pub async fn use_connection_with_cancel<T, Op>(
        &self,
        op: Op,
        attempts: usize,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        Op: for<'a> FnMut(&'a mut Connection) -> BoxFuture<'a, Result<T>>,
    {
        self.run_with_retry(op, attempts, Some(cancel)).await
    }

    /// Variant for operations that keep their connection past the call,
    /// such as streamed responses.
    ///
    /// `op` owns the lease; the connection returns to its pool when the
    /// lease is released or dropped. A transport error from `op` is retried
    /// like in [`use_connection`](Self::use_connection).
    pub async fn use_streaming_connection<T, Op, Fut>(&self, mut op: Op, attempts: usize) -> Result<T>
    where
        Op: FnMut(NodeLease) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut wait = self.inner.retry.initial_wait;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let outcome = match self.inner.strategy.select_node() {
                Some(node) => match node.lease_connection().await {
                    Ok(lease) => Outcome::from_result(op(lease).await),
                    Err(e) => Outcome::from_result(Err(e)),
                },
                None => Outcome::TransportFailure(no_node_available()),
            };

            match outcome {
                Outcome::Success(value) => return Ok(value),
                Outcome::ApplicationError(e) => return Err(e),
                Outcome::TransportFailure(e) => {
                    warn!("Streaming attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                self.pause(wait, None).await?;
                wait = self.inner.retry.next_wait(wait);
            }
        }

        Err(exhausted(attempts, last_error))
    }

    /// Sends one typed request and decodes the typed response, retrying
    /// with the cluster's default attempt budget.
    pub async fn execute_command<Req, Resp>(&self, request: Req) -> Result<Resp>
    where
        Req: Message,
        Resp: Message,
    {
        self.execute_command_with_attempts(request, self.inner.retry.max_attempts)
            .await
    }

    pub async fn execute_command_with_attempts<Req, Resp>(&self, request: Req, attempts: usize) -> Result<Resp>
    where
        Req: Message,
        Resp: Message,
    {
        let request = Arc::new(request);
        self.use_connection(
            move |connection| {
                let request = request.clone();
                async move { connection.execute::<Req, Resp>(&request).await }.boxed()
            },
            attempts,
        )
        .await
    }

    /// Lightweight handle for issuing typed operations.
    pub fn create_client(&self) -> StrataClient {
        StrataClient::new(self.clone())
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.inner.nodes
    }

    pub fn node_states(&self) -> Vec<(String, NodeState)> {
        self.inner
            .nodes
            .iter()
            .map(|node| (node.address().to_string(), node.state()))
            .collect()
    }

    pub fn strategy(&self) -> &SharedStrategy {
        &self.inner.strategy
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.inner.retry
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.inner.codec
    }

    /// Shuts every node down and waits for the health checkers to exit.
    ///
    /// Safe to call more than once; later operations fail with
    /// `NodeUnreachable`.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        for node in &self.inner.nodes {
            node.dispose();
        }

        let handles: Vec<_> = self.inner.health_checkers.lock().drain(..).collect();
        for joined in futures::future::join_all(handles).await {
            if let Err(e) = joined {
                warn!("Health checker task ended abnormally: {}", e);
            }
        }

        self.inner.strategy.initialise(Vec::new());
        info!("cluster disposed");
    }

    async fn run_with_retry<T, Op>(&self, mut op: Op, attempts: usize, cancel: Option<&CancellationToken>) -> Result<T>
    where
        Op: for<'a> FnMut(&'a mut Connection) -> BoxFuture<'a, Result<T>>,
    {
        let mut wait = self.inner.retry.initial_wait;
        let mut last_error = None;

        for attempt in 1..=attempts {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(StrataError::Cancelled);
            }

            let (target, outcome) = match self.inner.strategy.select_node() {
                Some(node) => {
                    let execution = node.execute(|connection| op(connection));
                    let outcome = match cancel {
                        Some(token) => tokio::select! {
                            biased;
                            _ = token.cancelled() => return Err(StrataError::Cancelled),
                            outcome = execution => outcome,
                        },
                        None => execution.await,
                    };
                    (node.address().to_string(), outcome)
                }
                None => (String::from("<none>"), Outcome::TransportFailure(no_node_available())),
            };

            match outcome {
                Outcome::Success(value) => return Ok(value),
                Outcome::ApplicationError(e) => {
                    debug!(node = %target, error = %e, "node returned an error");
                    return Err(e);
                }
                Outcome::TransportFailure(e) => {
                    warn!("Attempt {}/{} on {} failed: {}", attempt, attempts, target, e);
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                self.pause(wait, cancel).await?;
                wait = self.inner.retry.next_wait(wait);
            }
        }

        Err(exhausted(attempts, last_error))
    }

    async fn pause(&self, wait: Duration, cancel: Option<&CancellationToken>) -> Result<()> {
        match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(StrataError::Cancelled),
                _ = tokio::time::sleep(wait) => Ok(()),
            },
            None => {
                tokio::time::sleep(wait).await;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("nodes", &self.inner.nodes)
            .field("retry", &self.inner.retry)
            .field("disposed", &self.inner.disposed.load(Ordering::Acquire))
            .finish()
    }
}

impl Drop for ClusterInner {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Health loops exit on the node shutdown signal
        for node in &self.nodes {
            node.dispose();
        }
        debug!("cluster dropped without dispose");
    }
}

fn no_node_available() -> StrataError {
    StrataError::NodeOffline("no node available for selection".into())
}

fn exhausted(attempts: usize, last_error: Option<StrataError>) -> StrataError {
    StrataError::NodeUnreachable {
        attempts,
        last_error: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt was made".to_string()),
    }
}
