use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use strata_common::protocol::error::StrataError;

use crate::load_balancer::LoadBalancingStrategy;
use crate::node::{Node, NodeState};

/// Shared handle to the strategy nodes are selected from.
pub type SharedStrategy = Arc<dyn LoadBalancingStrategy<Arc<Node>>>;

/// Health checker for one node.
///
/// Runs on its own task and is the only thing that moves the node between
/// `Running` and `HealthChecking`. On every tick it probes the node (unless
/// the node is busy serving operations), takes it out of the rotation when
/// the probe fails and puts it back once a probe succeeds. It also closes
/// idle connections and keeps the pool at its minimum size.
pub struct HealthChecker {
    node: Arc<Node>,
    strategy: SharedStrategy,
    shutdown: watch::Receiver<bool>,
}

impl HealthChecker {
    /// Creates a new health checker.
    ///
    /// # Arguments
    /// * `node` - The node to watch
    /// * `strategy` - Rotation the node is removed from and re-added to
    pub fn new(node: Arc<Node>, strategy: SharedStrategy) -> Self {
        let shutdown = node.subscribe_shutdown();
        Self {
            node,
            strategy,
            shutdown,
        }
    }

    /// Starts the health checker task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Main health check loop
    async fn run(self) {
        let period = self.node.config().health_check_interval();
        // First probe one period after start, not immediately
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stopped(&mut shutdown) => break,
            }

            // A refill can sit in connect or login for its full timeout
            tokio::select! {
                _ = self.tick() => {}
                _ = stopped(&mut shutdown) => break,
            }
        }

        debug!(node = %self.node.address(), "health checker stopped");
    }

    /// One round: probe, update state and rotation, sweep idle connections.
    pub async fn tick(&self) {
        let state = self.node.state();
        match state {
            NodeState::Running | NodeState::HealthChecking => {}
            _ => return,
        }

        // A node serving operations is evidently reachable
        if state == NodeState::Running && self.node.in_flight() > 0 {
            self.node.sweep_idle().await;
            return;
        }

        let result = self.node.check_health().await;

        match (state, result) {
            // Every connection is checked out, so the node is serving work
            (NodeState::Running, Err(StrataError::PoolTimeout(_))) => {
                debug!(node = %self.node.address(), "pool busy, skipping health verdict");
            }
            (NodeState::Running, Err(e)) => {
                if self.node.transition(NodeState::Running, NodeState::HealthChecking) {
                    self.strategy.remove_node(&self.node);
                    warn!(
                        "Node {} removed from rotation after failed health check: {}",
                        self.node.address(),
                        e
                    );
                }
            }
            (NodeState::HealthChecking, Ok(())) => {
                if self.node.transition(NodeState::HealthChecking, NodeState::Running) {
                    self.strategy.add_node(self.node.clone());
                    info!("Node {} back in rotation after health check recovery", self.node.address());
                }
            }
            (NodeState::HealthChecking, Err(e)) => {
                debug!(node = %self.node.address(), error = %e, "node still unhealthy");
            }
            _ => {}
        }

        self.node.sweep_idle().await;
    }
}

/// Resolves once shutdown is signalled or the node is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
