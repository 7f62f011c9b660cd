use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use strata_common::protocol::error::{Result, StrataError};
use strata_common::transport::MessageCodec;

use crate::config::{NodeConfig, SecurityConfig};
use crate::connection::{Connection, ConnectionFactory, ConnectionLease, ConnectionSettings};
use crate::pool::{Consumed, PoolError, ResourcePool};

/// Lifecycle of a node.
///
/// `Created -> Running <-> HealthChecking`, then `ShuttingDown -> Shutdown`
/// once disposed. Only `Running` nodes accept work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Running,
    HealthChecking,
    ShuttingDown,
    Shutdown,
}

/// Result of a health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckStatus {
    Healthy,
    Unhealthy(String),
}

/// What happened to an operation sent to a node.
///
/// `TransportFailure` means the operation never produced an answer from the
/// node (no connection, pool exhausted, I/O failure) and may be retried
/// elsewhere. `ApplicationError` means the node answered with an error,
/// which retrying will not fix.
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    TransportFailure(StrataError),
    ApplicationError(StrataError),
}

impl<T> Outcome<T> {
    /// Classifies an operation result by its error kind.
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(e) if e.is_transport() => Outcome::TransportFailure(e),
            Err(e) => Outcome::ApplicationError(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Outcome::TransportFailure(_))
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::TransportFailure(e) | Outcome::ApplicationError(e) => Err(e),
        }
    }
}

impl From<PoolError<StrataError>> for StrataError {
    fn from(err: PoolError<StrataError>) -> Self {
        match err {
            PoolError::Timeout(after) => StrataError::PoolTimeout(after.as_millis() as u64),
            PoolError::Disposed => StrataError::PoolDisposed,
            PoolError::Build(e) => e,
            PoolError::Panicked => StrataError::Connection("operation panicked while holding a connection".into()),
        }
    }
}

/// Snapshot of a node's connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    pub live: usize,
    pub idle: usize,
    pub available_permits: usize,
}

/// One server endpoint: its connection pool and its availability.
pub struct Node {
    config: NodeConfig,
    address: String,
    pool: ResourcePool<ConnectionFactory>,
    state: RwLock<NodeState>,
    in_flight: Arc<AtomicUsize>,
    last_health_check: Mutex<Option<(Instant, HealthCheckStatus)>>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    pub fn new(config: NodeConfig, settings: ConnectionSettings) -> Self {
        let address = config.address();
        let pool = ResourcePool::new(ConnectionFactory::new(settings), config.pool_config());
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            address,
            pool,
            state: RwLock::new(NodeState::Created),
            in_flight: Arc::new(AtomicUsize::new(0)),
            last_health_check: Mutex::new(None),
            shutdown,
        }
    }

    /// Builds a node whose connections use the cluster's security settings.
    pub fn from_config(config: NodeConfig, security: &SecurityConfig, codec: MessageCodec) -> Result<Self> {
        let settings = ConnectionSettings::for_node(&config, security, codec)?;
        Ok(Self::new(config, settings))
    }

    /// Opens the minimum number of connections and starts accepting work.
    ///
    /// A node that cannot be reached yet still starts; its health checker
    /// takes it out of rotation on the first failed probe.
    pub async fn start(&self) -> Result<()> {
        if self.state() != NodeState::Created {
            return Err(StrataError::InvalidArgument(format!(
                "node {} already started ({:?})",
                self.address,
                self.state()
            )));
        }

        match self.pool.fill(self.config.min_connections()).await {
            Ok(opened) => debug!(node = %self.address, opened, "connection pool primed"),
            Err(e) => warn!(node = %self.address, error = %e, "could not open initial connections"),
        }

        self.transition(NodeState::Created, NodeState::Running);
        Ok(())
    }

    /// Runs `op` on a pooled connection.
    ///
    /// A connection that failed at the transport level has already closed
    /// itself and is destroyed instead of being returned to the pool.
    pub async fn execute<T, Op>(&self, op: Op) -> Outcome<T>
    where
        Op: for<'a> FnOnce(&'a mut Connection) -> BoxFuture<'a, Result<T>>,
    {
        if self.state() != NodeState::Running {
            return Outcome::TransportFailure(self.offline());
        }

        let _guard = InFlightGuard::enter(&self.in_flight);
        match self.pool.consume(op).await {
            Consumed::Acquired(result) => Outcome::from_result(result),
            Consumed::NotAcquired(err) => Outcome::TransportFailure(err.into()),
        }
    }

    /// Checks a connection out for as long as the caller keeps the lease.
    ///
    /// The lease counts as an operation in flight until it is released or
    /// dropped, so the health checker leaves a node serving streams alone.
    pub async fn lease_connection(&self) -> Result<NodeLease> {
        if self.state() != NodeState::Running {
            return Err(self.offline());
        }
        let in_flight = InFlightGuard::enter(&self.in_flight);
        let lease = self.pool.lease().await?;
        Ok(NodeLease {
            lease,
            _in_flight: in_flight,
        })
    }

    /// Pings the node over a pooled connection, bounded by the health check
    /// timeout, and records the result.
    pub async fn check_health(&self) -> Result<()> {
        let limit = self.config.health_check_timeout();
        let probe = self.pool.consume(|connection| connection.ping().boxed());

        let result = match tokio::time::timeout(limit, probe).await {
            Ok(Consumed::Acquired(result)) => result,
            Ok(Consumed::NotAcquired(err)) => Err(err.into()),
            Err(_) => Err(StrataError::Timeout(limit.as_millis() as u64)),
        };

        let status = match &result {
            Ok(()) => HealthCheckStatus::Healthy,
            Err(e) => HealthCheckStatus::Unhealthy(e.to_string()),
        };
        *self.last_health_check.lock() = Some((Instant::now(), status));

        result
    }

    /// Closes connections idle past the idle timeout, then tops the pool
    /// back up to its minimum while the node is running.
    pub async fn sweep_idle(&self) {
        let evicted = self.pool.evict_idle(self.config.idle_timeout());
        if evicted > 0 {
            debug!(node = %self.address, evicted, "closed idle connections");
        }

        if self.state() == NodeState::Running {
            if let Err(e) = self.pool.fill(self.config.min_connections()).await {
                debug!(node = %self.address, error = %e, "could not refill connection pool");
            }
        }
    }

    /// Stops the health checker and closes every connection.
    ///
    /// Safe to call more than once.
    pub fn dispose(&self) {
        {
            let mut state = self.state.write();
            if matches!(*state, NodeState::ShuttingDown | NodeState::Shutdown) {
                return;
            }
            *state = NodeState::ShuttingDown;
        }
        info!(node = %self.address, "node shutting down");

        self.shutdown.send_replace(true);
        let closed = self.pool.dispose();

        *self.state.write() = NodeState::Shutdown;
        info!(node = %self.address, closed, "node shut down");
    }

    /// Moves `from -> to`; returns false if the node was not in `from`.
    pub(crate) fn transition(&self, from: NodeState, to: NodeState) -> bool {
        let mut state = self.state.write();
        if *state != from {
            return false;
        }
        *state = to;
        drop(state);

        info!(node = %self.address, ?from, ?to, "node state changed");
        true
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Operations currently running through [`execute`](Self::execute),
    /// plus outstanding [`lease_connection`](Self::lease_connection) leases.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn last_health_check(&self) -> Option<(Instant, HealthCheckStatus)> {
        self.last_health_check.lock().clone()
    }

    pub fn pool_status(&self) -> PoolStatus {
        PoolStatus {
            max_size: self.pool.max_size(),
            live: self.pool.live_count(),
            idle: self.pool.idle_count(),
            available_permits: self.pool.available_permits(),
        }
    }

    fn offline(&self) -> StrataError {
        StrataError::NodeOffline(format!("{} is {:?}", self.address, self.state()))
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Node {}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .field("pool", &self.pool_status())
            .finish()
    }
}

/// A connection checked out of a node by [`Node::lease_connection`].
///
/// Gives the connection back to the pool when released or dropped.
pub struct NodeLease {
    // Dropped first: the connection is back before the node stops counting it
    lease: ConnectionLease,
    _in_flight: InFlightGuard,
}

impl NodeLease {
    /// Returns the connection to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Closes the connection instead of returning it.
    pub fn discard(self) {
        let NodeLease { lease, _in_flight } = self;
        lease.discard();
    }
}

impl Deref for NodeLease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.lease
    }
}

impl DerefMut for NodeLease {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.lease
    }
}

impl fmt::Debug for NodeLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeLease").field("connection", &*self.lease).finish()
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
