//! The storage server binary.
//!
//! `scribefs-ss <ss_id> <ns_ip> <ns_port> <client_port>` registers with
//! the naming server and serves its share of the namespace. The control
//! port is the client port plus 1000. Typing `DISCONNECT` on stdin shuts
//! the server down.

use std::path::PathBuf;

use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scribefs::config::{self, SsConfig};
use scribefs::storage::StorageServer;

#[derive(Parser, Debug)]
#[command(name = "scribefs-ss", about = "scribefs storage server")]
struct Args {
    /// Operator-chosen storage server id.
    ss_id: String,
    /// Naming server address.
    ns_ip: String,
    /// Naming server port.
    ns_port: u16,
    /// Port for client data-plane connections.
    client_port: u16,
    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Address advertised to clients; overrides discovery and the
    /// configuration file. Needed behind NAT or inside containers.
    #[arg(long)]
    advertise_ip: Option<String>,
    /// Root directory for live files; overrides the configuration file.
    #[arg(long)]
    storage_root: Option<PathBuf>,
    /// Root directory for undo backups; overrides the configuration file.
    #[arg(long)]
    backup_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config: SsConfig = config::load(args.config.as_deref())?;
    if args.advertise_ip.is_some() {
        config.advertise_ip = args.advertise_ip.clone();
    }
    if let Some(storage_root) = args.storage_root {
        config.storage_root = storage_root;
    }
    if let Some(backup_root) = args.backup_root {
        config.backup_root = backup_root;
    }

    let server =
        StorageServer::new(&args.ss_id, &args.ns_ip, args.ns_port, args.client_port, &config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(console(shutdown_tx));
    server.run_until(shutdown_rx).await?;
    Ok(())
}

/// Stdin console: the line `DISCONNECT` ends the server.
async fn console(shutdown: watch::Sender<bool>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().eq_ignore_ascii_case("DISCONNECT") {
            info!("console disconnect requested");
            let _ = shutdown.send(true);
            break;
        }
    }
}
