#![forbid(unsafe_code)]
//! gossipchain node binary: run a gateway, join the network and mine.

use clap::Parser;
use gossipchain::config::load_config;
use gossipchain::node::Node;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gossipchain-node", about = "Run a gossipchain node")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the configured P2P port
    #[arg(long)]
    port: Option<u16>,

    /// Bootstrap peers ("host:port"), in addition to the configured ones
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Start with mining disabled
    #[arg(long)]
    no_mine: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mut config = load_config(&args.config)?;
    if let Some(port) = args.port {
        config.network.p2p_port = port;
    }
    config.network.bootstrap_peers.extend(args.peers);
    if args.no_mine {
        config.miner.enabled = false;
    }

    let node = Arc::new(Node::new(config)?);
    node.clone().start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    node.shutdown().await;
    Ok(())
}
