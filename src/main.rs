//! Cascade node binary.
//!
//! Opens the sled store, boots the ledger core, and runs until interrupted.
//! The RPC transport is an external collaborator: embedders wire peers into
//! the `PeerSet` and pump inbound frames into the protocol inbox this binary
//! exposes. Run standalone, the node finalizes nothing but serves as a
//! storage-backed ledger that syncs once peers are attached.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use cascade::config::Config;
use cascade::ledger::Ledger;
use cascade::net::PeerSet;
use cascade::protocol::Protocol;
use cascade::store::SledKv;

/// Cascade leaderless ledger node.
#[derive(Parser, Debug)]
#[command(name = "cascade", version, about = "Cascade leaderless ledger node")]
struct Cli {
    /// Data directory for persistent storage.
    #[arg(long, default_value = "./cascade-data")]
    data_dir: PathBuf,

    /// JSON genesis document applied on first boot.
    #[arg(long)]
    genesis: Option<PathBuf>,

    /// Use the testnet consensus preset (wider Snowball sample).
    #[arg(long)]
    testnet: bool,

    /// Resident-memory ceiling in MiB for the stall watchdog (0 disables).
    #[arg(long)]
    max_memory_mb: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.data_dir)?;

    // Config file overlays defaults; CLI flags override the file.
    let mut config = Config::load(&cli.data_dir);
    if cli.testnet {
        config.snowball_k = Config::testnet().snowball_k;
    }
    if let Some(limit) = cli.max_memory_mb {
        config.max_memory_mb = limit;
    }

    let genesis = match &cli.genesis {
        Some(path) => Some(std::fs::read_to_string(path)?),
        None => None,
    };

    let kv = Arc::new(SledKv::open(&cli.data_dir.join("db"))?);
    let peers = PeerSet::new();
    let ledger = Ledger::new(kv, peers, config, genesis.as_deref())?;

    // Inbound RPC frames go here; outbound peers go into the PeerSet.
    let _inbox = Protocol::spawn(ledger.clone());

    ledger.start();
    tracing::info!(
        target: "node",
        data_dir = %cli.data_dir.display(),
        latest_block_index = ledger.blocks().latest().map(|b| b.index).unwrap_or(0),
        status = ledger.sync_status(),
        "Node started."
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!(target: "node", "Ctrl-C received, shutting down...");
    ledger.close().await;
    Ok(())
}
