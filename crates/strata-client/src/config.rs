//! Resolved client configuration.
//!
//! Every struct here is immutable once built. Builders accumulate settings
//! by value and validate them in `build()`, so a contract violation (an
//! empty host, `min > max`, no nodes) fails at construction time with
//! `StrataError::InvalidArgument`.

use std::collections::HashSet;
use std::time::Duration;

use strata_common::auth::Credentials;
use strata_common::protocol::error::{Result, StrataError};
use strata_common::transport::{CodecFormat, TlsConfig};

use crate::pool::PoolConfig;

/// Settings for one node endpoint.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    host: String,
    port: u16,
    min_connections: usize,
    max_connections: usize,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    idle_timeout: Duration,
    acquire_timeout: Duration,
    health_check_interval: Duration,
    health_check_timeout: Duration,
}

impl NodeConfig {
    pub fn builder(host: impl Into<String>, port: u16) -> NodeConfigBuilder {
        NodeConfigBuilder {
            host: host.into(),
            port,
            min_connections: 1,
            max_connections: 30,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(4),
            write_timeout: Duration::from_secs(4),
            idle_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(4),
            health_check_interval: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(2),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, also the node's identity inside a cluster.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn min_connections(&self) -> usize {
        self.min_connections
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    pub fn health_check_interval(&self) -> Duration {
        self.health_check_interval
    }

    pub fn health_check_timeout(&self) -> Duration {
        self.health_check_timeout
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.max_connections,
            min_size: self.min_connections,
            acquire_timeout: self.acquire_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfigBuilder {
    host: String,
    port: u16,
    min_connections: usize,
    max_connections: usize,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    idle_timeout: Duration,
    acquire_timeout: Duration,
    health_check_interval: Duration,
    health_check_timeout: Duration,
}

impl NodeConfigBuilder {
    pub fn min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<NodeConfig> {
        if self.host.trim().is_empty() {
            return Err(StrataError::InvalidArgument("node host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(StrataError::InvalidArgument("node port must not be 0".into()));
        }
        if self.max_connections == 0 {
            return Err(StrataError::InvalidArgument("max_connections must be at least 1".into()));
        }
        if self.min_connections > self.max_connections {
            return Err(StrataError::InvalidArgument(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.health_check_interval.is_zero() {
            return Err(StrataError::InvalidArgument("health_check_interval must be non-zero".into()));
        }

        Ok(NodeConfig {
            host: self.host,
            port: self.port,
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            idle_timeout: self.idle_timeout,
            acquire_timeout: self.acquire_timeout,
            health_check_interval: self.health_check_interval,
            health_check_timeout: self.health_check_timeout,
        })
    }
}

/// Retry configuration for cluster operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts made by one operation before it gives up
    ///
    /// Default: 3
    pub max_attempts: usize,
    /// Wait before the second attempt
    ///
    /// Default: 200ms
    pub initial_wait: Duration,
    /// Upper bound on any single wait
    ///
    /// Default: 5s
    pub max_wait: Duration,
    /// Each wait is the previous one times this factor
    ///
    /// Default: 1.0 (constant wait)
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Wait before attempt `attempt + 1`, given the wait used before `attempt`.
    ///
    /// Saturates at `max_wait`, including when the product overflows.
    pub fn next_wait(&self, previous: Duration) -> Duration {
        let factor = self.backoff_multiplier.max(0.0);
        Duration::try_from_secs_f64(previous.as_secs_f64() * factor)
            .map_or(self.max_wait, |scaled| scaled.min(self.max_wait))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_wait: Duration::from_millis(200),
            max_wait: Duration::from_secs(5),
            backoff_multiplier: 1.0,
        }
    }
}

/// TLS and authentication settings shared by every node of a cluster.
#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    tls: Option<TlsConfig>,
    credentials: Option<Credentials>,
}

impl SecurityConfig {
    /// Plain TCP, no authentication
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }
}

/// Everything a [`Cluster`](crate::Cluster) needs.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    nodes: Vec<NodeConfig>,
    retry: RetryConfig,
    security: SecurityConfig,
    codec_format: CodecFormat,
}

impl ClusterConfig {
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    pub fn nodes(&self) -> &[NodeConfig] {
        &self.nodes
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn security(&self) -> &SecurityConfig {
        &self.security
    }

    pub fn codec_format(&self) -> CodecFormat {
        self.codec_format
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClusterConfigBuilder {
    nodes: Vec<NodeConfig>,
    retry: RetryConfig,
    security: SecurityConfig,
    codec_format: CodecFormat,
}

impl ClusterConfigBuilder {
    pub fn node(mut self, node: NodeConfig) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn nodes(mut self, nodes: impl IntoIterator<Item = NodeConfig>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn security(mut self, security: SecurityConfig) -> Self {
        self.security = security;
        self
    }

    pub fn codec_format(mut self, format: CodecFormat) -> Self {
        self.codec_format = format;
        self
    }

    pub fn build(self) -> Result<ClusterConfig> {
        if self.nodes.is_empty() {
            return Err(StrataError::InvalidArgument("cluster needs at least one node".into()));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.address()) {
                return Err(StrataError::InvalidArgument(format!(
                    "node {} is configured twice",
                    node.address()
                )));
            }
        }

        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 0.0 {
            return Err(StrataError::InvalidArgument(
                "backoff_multiplier must be a finite, non-negative number".into(),
            ));
        }

        Ok(ClusterConfig {
            nodes: self.nodes,
            retry: self.retry,
            security: self.security,
            codec_format: self.codec_format,
        })
    }
}
