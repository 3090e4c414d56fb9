//! The naming server binary.
//!
//! Listens on the configured port (8080 by default) and coordinates the
//! cluster. Typing `SHUTDOWN` on stdin tears the cluster down gracefully:
//! every registered storage server is notified before the process exits.

use std::path::PathBuf;

use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scribefs::config::{self, NsConfig};
use scribefs::naming::NamingServer;

#[derive(Parser, Debug)]
#[command(name = "scribefs-ns", about = "scribefs naming server")]
struct Args {
    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listening port; overrides the configuration file.
    #[arg(long)]
    port: Option<u16>,
    /// Allow the EXEC operation (runs stored files under the local
    /// shell); overrides the configuration file.
    #[arg(long)]
    enable_exec: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config: NsConfig = config::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.enable_exec {
        config.enable_exec = true;
    }

    let server = NamingServer::bind(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(console(shutdown_tx));
    server.run_until(shutdown_rx).await?;
    Ok(())
}

/// Stdin console: the line `SHUTDOWN` ends the server.
async fn console(shutdown: watch::Sender<bool>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().eq_ignore_ascii_case("SHUTDOWN") {
            info!("console shutdown requested");
            let _ = shutdown.send(true);
            break;
        }
    }
}
