//! collab-relay: hosts collaborative note rooms over WebSocket.
//!
//! Clients join a room per note; the relay orders and fans out their updates
//! and presence, and keeps each room's merged body so late joiners can resync.

use anyhow::Result;
use clap::Parser;
use collab_core::RoomHub;
use collab_relay::{FileRoomArchive, RelayServer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "collab-relay")]
#[command(about = "Relay server for collaborative note editing")]
struct Args {
    /// Address to listen on for incoming connections
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Directory for the bodies of empty rooms (kept in memory when unset)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG; defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,collab_relay=debug,collab_core=debug"
    } else {
        "info,collab_relay=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting collab-relay");
    let server = match &args.data_dir {
        Some(dir) => {
            let archive = FileRoomArchive::new(dir)?;
            info!("Archiving empty rooms in {}", archive.dir().display());
            RelayServer::with_hub(Arc::new(RoomHub::with_archive(Arc::new(archive))))
        }
        None => RelayServer::new(),
    };
    let listener = RelayServer::bind(&args.listen).await?;

    info!("Relay running. Press Ctrl+C to stop.");
    tokio::select! {
        result = server.run(listener) => {
            if let Err(e) = result {
                error!("Relay stopped: {}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down");
    Ok(())
}
