//! # Strata CLI
//!
//! Command-line client for a Strata key-value cluster.
//!
//! The binary parses its arguments with `argh`, turns them into a
//! [`ClusterConfig`](strata_client::ClusterConfig) with [`connect::cluster_config`], starts a
//! [`Cluster`](strata_client::Cluster) and runs one operation against it.
//!
//! ## Key Commands
//!
//! - `strata ping`: Check that the cluster answers
//! - `strata info`: Print the node name and server version
//! - `strata get`, `strata put`, `strata delete`: Key/value operations

pub mod connect;
