//! # Strata CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Check that the cluster answers
//! strata -n 127.0.0.1:8087 -n 127.0.0.1:8088 ping
//!
//! # Key/value operations
//! strata -n 127.0.0.1:8087 put users alice admin
//! strata -n 127.0.0.1:8087 get users alice
//! strata -n 127.0.0.1:8087 delete users alice
//!
//! # Authenticated TLS cluster
//! strata -n db1.internal:8087 --user riak --password secret --ca-cert ca.pem info
//! ```
//!
//! Logs go to stderr and default to `info`, so `get` output can still be
//! piped; `RUST_LOG` overrides the level.

use anyhow::Result;
use argh::FromArgs;
use strata_cli::connect::{cluster_config, ConnectOptions};
use strata_client::Cluster;

#[derive(FromArgs)]
/// Strata - key-value cluster client
struct Cli {
    /// node address as host:port; repeat for every node in the cluster
    #[argh(option, short = 'n', long = "node")]
    nodes: Vec<String>,

    /// maximum pooled connections per node
    #[argh(option, long = "max-connections")]
    max_connections: Option<usize>,

    /// attempts per operation before giving up
    #[argh(option, short = 'a', long = "attempts")]
    attempts: Option<usize>,

    /// wait between attempts in milliseconds
    #[argh(option, long = "retry-wait-ms")]
    retry_wait_ms: Option<u64>,

    /// user name for authentication
    #[argh(option, short = 'u', long = "user")]
    user: Option<String>,

    /// password for authentication
    #[argh(option, short = 'p', long = "password")]
    password: Option<String>,

    /// name to verify the server certificate against; enables TLS
    #[argh(option, long = "tls-server-name")]
    tls_server_name: Option<String>,

    /// extra CA certificate (PEM) to trust; enables TLS
    #[argh(option, long = "ca-cert")]
    ca_cert: Option<String>,

    /// encode message bodies as JSON instead of postcard
    #[argh(switch, long = "json")]
    json: bool,

    #[argh(subcommand)]
    command: Commands,
}

impl Cli {
    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            nodes: self.nodes.clone(),
            max_connections: self.max_connections,
            attempts: self.attempts,
            retry_wait_ms: self.retry_wait_ms,
            user: self.user.clone(),
            password: self.password.clone(),
            tls_server_name: self.tls_server_name.clone(),
            ca_cert: self.ca_cert.clone(),
            json: self.json,
        }
    }
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Ping(PingArgs),
    Info(InfoArgs),
    Get(GetArgs),
    Put(PutArgs),
    Delete(DeleteArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "ping")]
/// check that the cluster answers
struct PingArgs {}

#[derive(FromArgs)]
#[argh(subcommand, name = "info")]
/// print node name and server version
struct InfoArgs {}

#[derive(FromArgs)]
#[argh(subcommand, name = "get")]
/// fetch a value and write it to stdout
struct GetArgs {
    /// bucket name
    #[argh(positional)]
    bucket: String,

    /// key within the bucket
    #[argh(positional)]
    key: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "put")]
/// store a value
struct PutArgs {
    /// bucket name
    #[argh(positional)]
    bucket: String,

    /// key within the bucket
    #[argh(positional)]
    key: String,

    /// value to store
    #[argh(positional)]
    value: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "delete")]
/// delete a key
struct DeleteArgs {
    /// bucket name
    #[argh(positional)]
    bucket: String,

    /// key within the bucket
    #[argh(positional)]
    key: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Default to INFO, but allow RUST_LOG env var to override
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = cluster_config(&cli.connect_options())?;
    tracing::info!("Connecting to {} node(s)", config.nodes().len());

    let cluster = Cluster::new(config).await?;
    let result = run(&cluster, cli.command).await;
    cluster.dispose().await;
    result
}

async fn run(cluster: &Cluster, command: Commands) -> Result<()> {
    let client = cluster.create_client();

    match command {
        Commands::Ping(_) => {
            client.ping().await?;
            println!("pong");
        }
        Commands::Info(_) => {
            let info = client.server_info().await?;
            println!("node: {}", info.node.as_deref().unwrap_or("unknown"));
            println!("version: {}", info.server_version.as_deref().unwrap_or("unknown"));
        }
        Commands::Get(args) => match client.get(args.bucket.as_str(), args.key.as_str()).await? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => anyhow::bail!("{}/{} not found", args.bucket, args.key),
        },
        Commands::Put(args) => {
            client.put(args.bucket, args.key, args.value).await?;
        }
        Commands::Delete(args) => {
            client.delete(args.bucket, args.key).await?;
        }
    }

    Ok(())
}
