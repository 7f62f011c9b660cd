//! Strata Client
//!
//! The connection and cluster core of the Strata key-value client.
//!
//! # Components
//!
//! - [`ResourcePool`]: bounded pool of reusable resources with timed acquire
//! - [`ConcurrentCycler`] / [`RoundRobinStrategy`]: node selection that
//!   tolerates nodes joining and leaving mid-rotation
//! - [`Connection`]: one framed TCP (optionally TLS) session to a node
//! - [`Node`]: a connection pool bound to one address, plus its state
//! - [`HealthChecker`]: per-node background probe that demotes and restores
//!   the node in the rotation
//! - [`Cluster`]: the retry loop every operation goes through
//! - [`StrataClient`]: typed operations on top of a cluster
//!
//! # Example
//!
//! ```no_run
//! use strata_client::{Cluster, ClusterConfig, NodeConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClusterConfig::builder()
//!     .node(NodeConfig::builder("127.0.0.1", 8087).build()?)
//!     .build()?;
//!
//! let cluster = Cluster::new(config).await?;
//! let client = cluster.create_client();
//! client.ping().await?;
//! cluster.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod health_checker;
pub mod load_balancer;
pub mod node;
pub mod pool;

pub use client::StrataClient;
pub use cluster::Cluster;
pub use config::{ClusterConfig, ClusterConfigBuilder, NodeConfig, NodeConfigBuilder, RetryConfig, SecurityConfig};
pub use connection::{Connection, ConnectionFactory, ConnectionLease, ConnectionSettings, ConnectionState};
pub use health_checker::HealthChecker;
pub use load_balancer::{ConcurrentCycler, LoadBalancingStrategy, RoundRobinStrategy};
pub use node::{Node, NodeLease, NodeState, Outcome, PoolStatus};
pub use pool::{Consumed, Lease, PoolConfig, PoolError, ResourceFactory, ResourcePool};
