use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use strata_client::{ClusterConfig, NodeConfig, RetryConfig, SecurityConfig};
use strata_common::auth::Credentials;
use strata_common::transport::{CodecFormat, TlsConfig};

/// Connection options shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub nodes: Vec<String>,
    pub max_connections: Option<usize>,
    pub attempts: Option<usize>,
    pub retry_wait_ms: Option<u64>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub tls_server_name: Option<String>,
    pub ca_cert: Option<String>,
    pub json: bool,
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub fn parse_node_address(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("Invalid node address '{}': expected host:port", addr))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(anyhow!("Invalid node address '{}': missing host", addr));
    }

    let port: u16 = port
        .parse()
        .with_context(|| format!("Invalid port in node address '{}'", addr))?;

    Ok((host.to_string(), port))
}

/// Builds the cluster configuration for the given options.
pub fn cluster_config(options: &ConnectOptions) -> Result<ClusterConfig> {
    if options.nodes.is_empty() {
        return Err(anyhow!("No nodes specified! Use --node <host:port> to add nodes."));
    }

    let mut builder = ClusterConfig::builder();
    for addr in &options.nodes {
        let (host, port) = parse_node_address(addr)?;
        let mut node = NodeConfig::builder(host, port);
        if let Some(max) = options.max_connections {
            node = node.max_connections(max);
        }
        builder = builder.node(node.build()?);
    }

    let mut retry = RetryConfig::default();
    if let Some(attempts) = options.attempts {
        retry.max_attempts = attempts;
    }
    if let Some(wait) = options.retry_wait_ms {
        retry.initial_wait = Duration::from_millis(wait);
    }

    Ok(builder
        .retry(retry)
        .security(security(options)?)
        .codec_format(if options.json {
            CodecFormat::Json
        } else {
            CodecFormat::Postcard
        })
        .build()?)
}

fn security(options: &ConnectOptions) -> Result<SecurityConfig> {
    let mut security = SecurityConfig::none();

    match (&options.user, &options.password) {
        (Some(user), Some(password)) => {
            security = security.with_credentials(Credentials::new(user.clone(), password.clone()));
        }
        (None, None) => {}
        _ => return Err(anyhow!("--user and --password must be given together")),
    }

    if options.tls_server_name.is_some() || options.ca_cert.is_some() {
        let server_name = match &options.tls_server_name {
            Some(name) => name.clone(),
            None => parse_node_address(&options.nodes[0])?.0,
        };
        let mut tls = TlsConfig::builder(server_name);
        if let Some(path) = &options.ca_cert {
            tls = tls.ca_certificate(path);
        }
        security = security.with_tls(tls.build()?);
    }

    Ok(security)
}
