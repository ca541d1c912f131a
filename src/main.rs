use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use quorum::server::{Config, Server};

/// One node of a replicated key-value store.
#[derive(Parser)]
struct Args {
    /// This node's index into the peer list.
    #[arg(long)]
    me: usize,

    /// Raft RPC address of each node, in cluster order. Repeat once per
    /// node; every node must be given the same list.
    #[arg(long = "peer", required = true)]
    peers: Vec<String>,

    /// Address for the HTTP client API.
    #[arg(long)]
    api: String,

    /// Directory for durable state.
    #[arg(long)]
    data_dir: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    Server::start(Config {
        me: args.me,
        peers: args.peers,
        api_addr: args.api,
        data_dir: args.data_dir,
    })?
    .run()?;

    Ok(())
}
